use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use vigil_core::{ResourceManagerConfig, VigilResult};
use vigil_domain::ports::TaskQueue;

use crate::resource_manager::GpuResourceManager;

/// Worker失效检测服务
///
/// 周期性扫描心跳超时的Worker：标记为不可达、强制释放其全部
/// GPU分配，并把它持有的在途任务退回队列重新投递（按崩溃处理，
/// 尝试计数照常递增，而非逻辑失败）。
pub struct WorkerFailureDetector {
    resources: Arc<GpuResourceManager>,
    queue: Arc<dyn TaskQueue>,
    config: ResourceManagerConfig,
}

impl WorkerFailureDetector {
    pub fn new(
        resources: Arc<GpuResourceManager>,
        queue: Arc<dyn TaskQueue>,
        config: ResourceManagerConfig,
    ) -> Self {
        Self {
            resources,
            queue,
            config,
        }
    }

    /// 单次检测：返回本轮处理的失效Worker数量
    pub async fn run_once(&self) -> VigilResult<usize> {
        let now = Utc::now();
        let failed = self.resources.sweep_unreachable(now).await;

        for worker_id in &failed {
            match self.queue.requeue_inflight(worker_id).await {
                Ok(jobs) => {
                    if !jobs.is_empty() {
                        warn!(
                            worker_id,
                            requeued = jobs.len(),
                            "失效Worker的在途任务已退回队列"
                        );
                    }
                }
                Err(e) => {
                    error!(worker_id, error = %e, "退回失效Worker任务失败");
                }
            }
        }

        self.resources.cleanup_offline(now).await;
        Ok(failed.len())
    }

    /// 启动检测循环，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> VigilResult<()> {
        info!(
            interval_seconds = self.config.sweep_interval_seconds,
            timeout_seconds = self.config.heartbeat_timeout_seconds,
            "启动Worker失效检测循环"
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds));
        // 第一个tick立即完成，跳过以免启动即扫描
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "失效检测执行失败");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("失效检测循环收到关闭信号");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::QueueConfig;
    use vigil_domain::models::{
        Job, JobPriority, JobRequest, JobState, WorkerHeartbeat, WorkerRegistration,
    };
    use vigil_infrastructure::InMemoryTaskQueue;

    fn make_job() -> Job {
        Job::new(
            JobRequest {
                stream_id: "cam-01".to_string(),
                segment_ref: "segments/cam-01/0001.ts".to_string(),
                priority: JobPriority::Normal,
                required_units: 2,
            },
            300,
        )
    }

    #[tokio::test]
    async fn test_dead_worker_jobs_redelivered_with_incremented_attempt() {
        let config = ResourceManagerConfig {
            heartbeat_timeout_seconds: 0,
            ..ResourceManagerConfig::default()
        };
        let resources = Arc::new(GpuResourceManager::new(config.clone()));
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let detector =
            WorkerFailureDetector::new(Arc::clone(&resources), Arc::clone(&queue), config);

        resources
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                hostname: "h".to_string(),
                total_units: 4,
            })
            .await
            .unwrap();
        resources.try_allocate("w1", 2).await.unwrap();

        queue.enqueue(make_job()).await.unwrap();
        let job = queue.dequeue("w1", 4).await.unwrap().unwrap();
        assert_eq!(job.attempt_count, 1);

        // 心跳超时为0，任何时刻扫描都视为超时
        tokio::time::sleep(Duration::from_millis(10)).await;
        let failed = detector.run_once().await.unwrap();
        assert_eq!(failed, 1);

        // 分配被强制释放
        let slot = resources.get_worker("w1").await.unwrap();
        assert_eq!(slot.allocated_units, 0);

        // 任务重新投递给其他Worker，尝试计数+1
        let redelivered = queue.dequeue("w2", 4).await.unwrap().unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempt_count, 2);
        assert_eq!(redelivered.state, JobState::Assigned);
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_not_swept() {
        let config = ResourceManagerConfig {
            heartbeat_timeout_seconds: 3600,
            ..ResourceManagerConfig::default()
        };
        let resources = Arc::new(GpuResourceManager::new(config.clone()));
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let detector =
            WorkerFailureDetector::new(Arc::clone(&resources), Arc::clone(&queue), config);

        resources
            .register(WorkerRegistration {
                worker_id: "w1".to_string(),
                hostname: "h".to_string(),
                total_units: 4,
            })
            .await
            .unwrap();
        resources
            .heartbeat(WorkerHeartbeat {
                worker_id: "w1".to_string(),
                load: 0.2,
                active_jobs: 0,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(detector.run_once().await.unwrap(), 0);
    }
}
