use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use vigil_core::VigilResult;

use crate::models::{
    CandidateEvent, Detection, Frame, Job, JobLifecycleEvent, WorkerHeartbeat, WorkerRegistration,
};

/// 队列统计信息
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    /// 各优先级层的待处理深度（老化提升后按当前生效层计）
    pub pending_high: usize,
    pub pending_normal: usize,
    pub pending_low: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

/// 持久任务队列抽象接口
///
/// at-least-once投递语义：出队后未确认的任务在可见性超时后
/// 重新可投递；nack的任务按退避策略重新入队或进入死信队列。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 入队任务
    async fn enqueue(&self, job: Job) -> VigilResult<()>;

    /// 非阻塞出队，无可用任务时返回None，调用方自行退避重试
    ///
    /// capacity_units为调用方Worker的总容量：资源需求超出该容量的
    /// 任务不会投递给它，留在队列中等待有能力的Worker拉取。
    async fn dequeue(&self, worker_id: &str, capacity_units: u32) -> VigilResult<Option<Job>>;

    /// Worker开始处理已出队的任务（assigned → processing）
    async fn start(&self, job_id: &str) -> VigilResult<()>;

    /// 确认任务处理完成，从队列中永久移除
    async fn ack(&self, job_id: &str) -> VigilResult<()>;

    /// 拒绝任务：未达最大尝试次数时按退避重新入队，否则进入死信队列
    async fn nack(&self, job_id: &str, reason: &str) -> VigilResult<()>;

    /// 取消pending/assigned状态的任务，终态任务为no-op
    async fn cancel(&self, job_id: &str) -> VigilResult<()>;

    /// 查询任务当前状态
    async fn get_job(&self, job_id: &str) -> VigilResult<Option<Job>>;

    /// 将指定Worker持有的在途任务全部重新入队（Worker崩溃恢复）
    async fn requeue_inflight(&self, worker_id: &str) -> VigilResult<Vec<String>>;

    /// 死信队列内容，供操作员检视
    async fn dead_letters(&self) -> VigilResult<Vec<Job>>;

    /// 操作员手动重新提交死信任务，尝试计数清零
    async fn resubmit(&self, job_id: &str) -> VigilResult<()>;

    /// 队列统计
    async fn stats(&self) -> VigilResult<QueueStats>;

    /// 订阅任务生命周期通知（每次状态迁移均可观测）
    fn subscribe_lifecycle(&self) -> tokio::sync::broadcast::Receiver<JobLifecycleEvent>;
}

/// GPU资源协调接口
///
/// Worker进程通过该接口向资源管理器注册、上报心跳、申请和归还
/// GPU计算单元。分配必须原子：容量不足时返回false且不产生副作用。
#[async_trait]
pub trait ResourceAllocator: Send + Sync {
    /// 注册Worker并声明其GPU容量
    async fn register(&self, registration: WorkerRegistration) -> VigilResult<()>;

    /// 注销Worker，释放其全部分配
    async fn deregister(&self, worker_id: &str) -> VigilResult<()>;

    /// Worker周期性心跳，携带负载信息
    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> VigilResult<()>;

    /// 尝试原子分配计算单元，容量不足时返回false
    async fn try_allocate(&self, worker_id: &str, units: u32) -> VigilResult<bool>;

    /// 归还计算单元，多还时截断到零，幂等
    async fn release(&self, worker_id: &str, units: u32) -> VigilResult<()>;
}

/// 事件消费者，由下游协作方（持久化、告警）实现
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &CandidateEvent) -> VigilResult<()>;
}

/// 事件总线抽象接口
///
/// at-least-once投递；同一流的事件对单个消费者按发布顺序投递，
/// 跨流不保证顺序。
#[async_trait]
pub trait EventBus: Send + Sync {
    /// 发布候选事件
    async fn publish(&self, event: CandidateEvent) -> VigilResult<()>;

    /// 注册消费者
    async fn subscribe(&self, consumer: Arc<dyn EventConsumer>) -> VigilResult<()>;

    /// 事件死信队列内容，保留原始负载供手动重放
    async fn dead_letters(&self) -> VigilResult<Vec<CandidateEvent>>;
}

/// 可插拔的目标检测后端能力接口
///
/// 不同模型家族作为可替换实现，不使用继承链。
#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// 对一批帧做推理，返回逐帧的检测结果
    async fn detect(&self, batch: &[Frame]) -> VigilResult<Vec<Vec<Detection>>>;
}

/// 帧流，按时间顺序产出已解码的帧
#[async_trait]
pub trait FrameStream: Send {
    /// 下一帧，片段结束时返回None
    async fn next_frame(&mut self) -> VigilResult<Option<Frame>>;
}

/// 视频片段帧源，消费已切分、已校验的片段引用
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, segment_ref: &str) -> VigilResult<Box<dyn FrameStream>>;
}
