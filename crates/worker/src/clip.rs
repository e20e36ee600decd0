use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use vigil_domain::models::CandidateEvent;

/// 一段待提取的事件片段
#[derive(Debug, Clone, PartialEq)]
pub struct ClipWindow {
    /// 片段引用标识，不含完整视频数据
    pub clip_ref: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 事件片段提取器
///
/// 以事件时间窗为中心向前后各扩展固定填充时长，并钳制在
/// 源片段边界内，保证上下文完整且不越界。
pub struct ClipExtractor {
    padding: Duration,
}

impl ClipExtractor {
    pub fn new(padding_seconds: f64) -> Self {
        Self {
            padding: Duration::milliseconds((padding_seconds * 1000.0) as i64),
        }
    }

    /// 计算事件对应的片段窗口
    pub fn extract(
        &self,
        event: &CandidateEvent,
        segment_start: DateTime<Utc>,
        segment_end: DateTime<Utc>,
    ) -> ClipWindow {
        let start = (event.window_start - self.padding).max(segment_start);
        let end = (event.window_end + self.padding).min(segment_end);
        let clip_ref = format!(
            "event_{}_stream_{}_{}",
            event.event_code,
            event.stream_id,
            start.format("%Y%m%d%H%M%S%3f"),
        );
        debug!(
            event_id = %event.id,
            clip_ref = %clip_ref,
            start = %start,
            end = %end,
            "事件片段窗口已计算"
        );
        ClipWindow {
            clip_ref,
            start,
            end,
        }
    }
}
