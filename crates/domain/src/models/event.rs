use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobState;

/// 规则触发的候选事件，创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub id: String,
    /// 事件代码，如 "ppe_violation"
    pub event_code: String,
    pub stream_id: String,
    /// 触发该事件的轨迹
    pub track_ids: Vec<u64>,
    pub confidence: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// 产生该事件的规则
    pub rule_id: String,
    /// 事件片段引用（不存储完整视频）
    pub clip_ref: Option<String>,
}

impl CandidateEvent {
    pub fn new(
        event_code: &str,
        stream_id: &str,
        track_ids: Vec<u64>,
        confidence: f64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        rule_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_code: event_code.to_string(),
            stream_id: stream_id.to_string(),
            track_ids,
            confidence,
            window_start,
            window_end,
            rule_id: rule_id.to_string(),
            clip_ref: None,
        }
    }
}

/// 任务生命周期通知，供外部监控方消费
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLifecycleEvent {
    pub job_id: String,
    pub old_state: JobState,
    pub new_state: JobState,
    pub timestamp: DateTime<Utc>,
}

impl JobLifecycleEvent {
    pub fn new(job_id: &str, old_state: JobState, new_state: JobState) -> Self {
        Self {
            job_id: job_id.to_string(),
            old_state,
            new_state,
            timestamp: Utc::now(),
        }
    }
}
