use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use vigil_core::{OrchestratorConfig, VigilError, VigilResult};
use vigil_domain::models::{Job, JobLifecycleEvent, JobPriority, JobRequest};
use vigil_domain::ports::{QueueStats, TaskQueue};

use crate::resource_manager::{GpuResourceManager, ResourceStats};

/// 编排器统计信息
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub queue: QueueStats,
    pub resources: ResourceStats,
}

/// 任务编排器
///
/// 接收摄取请求并转为可调度任务。提交时只做顾问性的容量检查，
/// 真正的准入决策推迟到Worker出队路径上的try_allocate，避免
/// 队头阻塞，并允许任务排队期间的优先级重排。
pub struct JobOrchestrator {
    queue: Arc<dyn TaskQueue>,
    resources: Arc<GpuResourceManager>,
    config: OrchestratorConfig,
}

impl JobOrchestrator {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        resources: Arc<GpuResourceManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            resources,
            config,
        }
    }

    /// 提交任务请求，返回任务ID
    ///
    /// 未声明资源需求的请求使用配置的默认计算单元数。最低优先
    /// 级的任务不允许排队等待容量出现：放置策略当前选不出任何
    /// 可承载的Worker时直接拒绝；其余情况一律入队成功——提交
    /// 成功是顾问性的，不构成资源预留。
    pub async fn submit(&self, mut request: JobRequest) -> VigilResult<String> {
        if request.required_units == 0 {
            request.required_units = self.config.default_required_units;
        }

        if request.priority == JobPriority::Low
            && self
                .resources
                .select_worker(request.required_units)
                .await
                .is_none()
        {
            warn!(
                stream_id = %request.stream_id,
                required_units = request.required_units,
                "无可承载的Worker，拒绝低优先级任务"
            );
            return Err(VigilError::CapacityUnavailable(format!(
                "无Worker可满足 {} 个计算单元的需求",
                request.required_units
            )));
        }

        let job = Job::new(request, self.config.default_deadline_seconds);
        let job_id = job.id.clone();
        info!(
            job_id = %job_id,
            stream_id = %job.stream_id,
            segment_ref = %job.segment_ref,
            priority = ?job.priority,
            "任务已创建"
        );
        self.queue.enqueue(job).await?;
        Ok(job_id)
    }

    /// 取消任务：pending/assigned转为失败终态，终态任务no-op
    pub async fn cancel(&self, job_id: &str) -> VigilResult<()> {
        self.queue.cancel(job_id).await
    }

    /// 查询任务当前状态，含dead-lettered及其最后失败原因
    pub async fn get_status(&self, job_id: &str) -> VigilResult<Job> {
        self.queue
            .get_job(job_id)
            .await?
            .ok_or_else(|| VigilError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    /// 订阅任务生命周期通知
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.queue.subscribe_lifecycle()
    }

    /// 队列与资源统计
    pub async fn stats(&self) -> VigilResult<OrchestratorStats> {
        Ok(OrchestratorStats {
            queue: self.queue.stats().await?,
            resources: self.resources.stats().await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{QueueConfig, ResourceManagerConfig};
    use vigil_domain::models::{JobState, WorkerRegistration};
    use vigil_infrastructure::InMemoryTaskQueue;

    fn setup() -> (JobOrchestrator, Arc<dyn TaskQueue>, Arc<GpuResourceManager>) {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let resources = Arc::new(GpuResourceManager::new(ResourceManagerConfig::default()));
        let orchestrator = JobOrchestrator::new(
            Arc::clone(&queue),
            Arc::clone(&resources),
            OrchestratorConfig::default(),
        );
        (orchestrator, queue, resources)
    }

    fn request(priority: JobPriority) -> JobRequest {
        JobRequest {
            stream_id: "cam-01".to_string(),
            segment_ref: "segments/cam-01/0001.ts".to_string(),
            priority,
            required_units: 2,
        }
    }

    #[tokio::test]
    async fn test_submit_enqueues_pending_job() {
        let (orchestrator, _, resources) = setup();
        resources
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                hostname: "h".to_string(),
                total_units: 4,
            })
            .await
            .unwrap();

        let job_id = orchestrator.submit(request(JobPriority::Normal)).await.unwrap();
        let job = orchestrator.get_status(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_low_priority_rejected_without_capacity() {
        let (orchestrator, _, _) = setup();
        // 没有注册任何Worker
        let result = orchestrator.submit(request(JobPriority::Low)).await;
        assert!(matches!(result, Err(VigilError::CapacityUnavailable(_))));
    }

    #[tokio::test]
    async fn test_low_priority_admission_follows_free_capacity() {
        let (orchestrator, _, resources) = setup();
        resources
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                hostname: "h".to_string(),
                total_units: 4,
            })
            .await
            .unwrap();

        // 有空闲容量时低优先级任务被接纳
        assert!(orchestrator.submit(request(JobPriority::Low)).await.is_ok());

        // 容量被占满后放置策略选不出Worker，低优先级不允许排队等待
        assert!(resources.try_allocate("w1", 4).await.unwrap());
        let result = orchestrator.submit(request(JobPriority::Low)).await;
        assert!(matches!(result, Err(VigilError::CapacityUnavailable(_))));
    }

    #[tokio::test]
    async fn test_submit_applies_default_required_units() {
        let (orchestrator, _, _) = setup();
        let job_id = orchestrator
            .submit(JobRequest {
                required_units: 0,
                ..request(JobPriority::Normal)
            })
            .await
            .unwrap();

        // 未声明资源需求的请求落到配置的默认值
        let job = orchestrator.get_status(&job_id).await.unwrap();
        assert_eq!(
            job.required_units,
            OrchestratorConfig::default().default_required_units
        );
    }

    #[tokio::test]
    async fn test_high_priority_queues_without_capacity() {
        let (orchestrator, _, _) = setup();
        // 高优先级允许排队等待容量出现
        let job_id = orchestrator.submit(request(JobPriority::High)).await.unwrap();
        assert_eq!(
            orchestrator.get_status(&job_id).await.unwrap().state,
            JobState::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_then_status_reflects_failure() {
        let (orchestrator, _, _) = setup();
        let job_id = orchestrator.submit(request(JobPriority::Normal)).await.unwrap();
        orchestrator.cancel(&job_id).await.unwrap();

        let job = orchestrator.get_status(&job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_failure.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_get_status_unknown_job() {
        let (orchestrator, _, _) = setup();
        assert!(matches!(
            orchestrator.get_status("nope").await,
            Err(VigilError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_observable_through_orchestrator() {
        let (orchestrator, queue, _) = setup();
        let mut rx = orchestrator.subscribe_lifecycle();

        let job_id = orchestrator.submit(request(JobPriority::Normal)).await.unwrap();
        let job = queue.dequeue("w1", 4).await.unwrap().unwrap();
        assert_eq!(job.id, job_id);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.new_state, JobState::Assigned);
    }
}
