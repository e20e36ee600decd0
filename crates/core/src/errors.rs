use thiserror::Error;

/// 视频事件检测系统错误类型定义
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("无可用容量: {0}")]
    CapacityUnavailable(String),

    #[error("任务未找到: {id}")]
    JobNotFound { id: String },

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("Worker不可达: {id} (最后心跳: {last_heartbeat})")]
    WorkerUnreachable { id: String, last_heartbeat: String },

    #[error("推理超时: 批次处理超过 {timeout_ms}ms")]
    InferenceTimeout { timeout_ms: u64 },

    #[error("推理错误: {0}")]
    InferenceError(String),

    #[error("事件投递失败: {0}")]
    DeliveryFailure(String),

    #[error("重试次数已耗尽: {id} (尝试 {attempts} 次)")]
    Exhausted { id: String, attempts: u32 },

    #[error("视频帧源错误: {0}")]
    FrameSource(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for VigilError {
    fn from(e: serde_json::Error) -> Self {
        VigilError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type VigilResult<T> = std::result::Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_contains_context() {
        let err = VigilError::JobNotFound {
            id: "job-42".to_string(),
        };
        assert!(err.to_string().contains("job-42"));

        let err = VigilError::Exhausted {
            id: "job-7".to_string(),
            attempts: 3,
        };
        assert!(err.to_string().contains('3'));
    }
}
