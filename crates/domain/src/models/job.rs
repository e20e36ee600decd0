use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 视频处理任务，一个任务对应一个摄取片段
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub stream_id: String,
    /// 已切分、已校验的视频片段引用
    pub segment_ref: String,
    pub priority: JobPriority,
    pub state: JobState,
    pub assigned_worker: Option<String>,
    pub attempt_count: u32,
    /// 最小GPU资源需求（计算单元）
    pub required_units: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 近实时SLA截止时间
    pub deadline: DateTime<Utc>,
    /// 最近一次失败原因（dead-lettered时保留）
    pub last_failure: Option<String>,
}

/// 任务优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobPriority {
    #[serde(rename = "LOW")]
    Low = 0,
    #[serde(rename = "NORMAL")]
    Normal = 1,
    #[serde(rename = "HIGH")]
    High = 2,
}

impl JobPriority {
    /// 老化提升：上移一个优先级，High保持不变
    pub fn promoted(self) -> Self {
        match self {
            JobPriority::Low => JobPriority::Normal,
            JobPriority::Normal => JobPriority::High,
            JobPriority::High => JobPriority::High,
        }
    }
}

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "DEAD_LETTERED")]
    DeadLettered,
}

impl JobState {
    /// 终态任务不再变更
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLettered
        )
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub stream_id: String,
    pub segment_ref: String,
    pub priority: JobPriority,
    pub required_units: u32,
}

impl Job {
    /// 根据提交请求创建新任务
    pub fn new(request: JobRequest, deadline_seconds: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            stream_id: request.stream_id,
            segment_ref: request.segment_ref,
            priority: request.priority,
            state: JobState::Pending,
            assigned_worker: None,
            attempt_count: 0,
            required_units: request.required_units,
            created_at: now,
            updated_at: now,
            deadline: now + Duration::seconds(deadline_seconds),
            last_failure: None,
        }
    }

    /// 状态迁移，终态任务保持不变并返回false
    pub fn transition(&mut self, new_state: JobState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = new_state;
        self.updated_at = Utc::now();
        true
    }

    /// 操作员重新提交死信任务：尝试计数清零，回到pending
    ///
    /// 终态不可变的唯一例外，仅对dead-lettered任务生效。
    pub fn resubmit(&mut self) -> bool {
        if self.state != JobState::DeadLettered {
            return false;
        }
        self.state = JobState::Pending;
        self.attempt_count = 0;
        self.last_failure = None;
        self.updated_at = Utc::now();
        true
    }

    /// 是否已超过SLA截止时间
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}
