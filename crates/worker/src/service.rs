use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use vigil_core::{PipelineConfig, VigilResult, WorkerConfig};
use vigil_domain::models::{Job, Rule, WorkerHeartbeat, WorkerRegistration};
use vigil_domain::ports::{Detector, EventBus, FrameSource, ResourceAllocator, TaskQueue};

use crate::pipeline::{PipelineOutcome, StreamPipeline};

/// Worker服务
///
/// 注册到资源管理器后进入主循环：周期性上报心跳，在并发流
/// 上限内从队列拉取任务，每个任务spawn独立的流水线任务；
/// 流水线结束后按结局ack或nack。收到停机信号后不再拉取新
/// 任务，等待在途流水线收尾再注销。
pub struct WorkerService {
    config: WorkerConfig,
    pipeline_config: PipelineConfig,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<dyn EventBus>,
    allocator: Arc<dyn ResourceAllocator>,
    detector: Arc<dyn Detector>,
    frame_source: Arc<dyn FrameSource>,
    rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
}

impl WorkerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WorkerConfig,
        pipeline_config: PipelineConfig,
        queue: Arc<dyn TaskQueue>,
        bus: Arc<dyn EventBus>,
        allocator: Arc<dyn ResourceAllocator>,
        detector: Arc<dyn Detector>,
        frame_source: Arc<dyn FrameSource>,
        rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
    ) -> Self {
        Self {
            config,
            pipeline_config,
            queue,
            bus,
            allocator,
            detector,
            frame_source,
            rules_rx,
        }
    }

    fn hostname(&self) -> String {
        if !self.config.hostname.is_empty() {
            return self.config.hostname.clone();
        }
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// 主循环，直到收到停机信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> VigilResult<()> {
        let worker_id = self.config.worker_id.clone();
        self.allocator
            .register(WorkerRegistration {
                worker_id: worker_id.clone(),
                hostname: self.hostname(),
                total_units: self.config.capacity_units,
            })
            .await?;
        info!(
            worker_id = %worker_id,
            capacity_units = self.config.capacity_units,
            max_concurrent_streams = self.config.max_concurrent_streams,
            "Worker已注册，进入主循环"
        );

        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.heartbeat_interval_seconds.max(1),
        ));
        let mut poll =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        let mut active: JoinSet<(String, PipelineOutcome)> = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(worker_id = %worker_id, in_flight = active.len(), "收到停机信号，停止拉取新任务");
                    break;
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat(&worker_id, active.len()).await;
                }
                _ = poll.tick() => {
                    if active.len() < self.config.max_concurrent_streams {
                        match self.queue.dequeue(&worker_id, self.config.capacity_units).await {
                            Ok(Some(job)) => self.launch(&mut active, job).await,
                            Ok(None) => {}
                            Err(e) => warn!(worker_id = %worker_id, error = %e, "出队失败"),
                        }
                    }
                }
                Some(finished) = active.join_next(), if !active.is_empty() => {
                    self.settle(finished).await;
                    gauge!("vigil_worker_active_streams").set(active.len() as f64);
                }
            }
        }

        // 停机收尾：在途流水线处理完毕后再注销
        while let Some(finished) = active.join_next().await {
            self.settle(finished).await;
        }
        if let Err(e) = self.allocator.deregister(&worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "注销失败");
        }
        info!(worker_id = %worker_id, "Worker已退出");
        Ok(())
    }

    /// 开始处理一个已出队的任务
    async fn launch(&self, active: &mut JoinSet<(String, PipelineOutcome)>, job: Job) {
        if let Err(e) = self.queue.start(&job.id).await {
            warn!(job_id = %job.id, error = %e, "标记任务开始失败");
            return;
        }
        info!(
            job_id = %job.id,
            stream_id = %job.stream_id,
            priority = ?job.priority,
            attempt = job.attempt_count,
            "任务分派到流水线"
        );
        counter!("vigil_worker_jobs_started").increment(1);

        let job_id = job.id.clone();
        let pipeline = StreamPipeline::new(
            job,
            &self.config.worker_id,
            self.pipeline_config.clone(),
            self.config.max_consecutive_batch_failures,
            self.detector.clone(),
            self.allocator.clone(),
            self.queue.clone(),
            self.bus.clone(),
            self.frame_source.clone(),
            self.rules_rx.clone(),
        );
        active.spawn(async move { (job_id, pipeline.run().await) });
        gauge!("vigil_worker_active_streams").increment(1.0);
    }

    /// 按流水线结局向队列确认
    async fn settle(
        &self,
        finished: Result<(String, PipelineOutcome), tokio::task::JoinError>,
    ) {
        let (job_id, outcome) = match finished {
            Ok(pair) => pair,
            Err(e) => {
                // 流水线任务panic，无法得知任务ID之外的信息
                error!(error = %e, "流水线任务异常退出");
                return;
            }
        };
        match outcome {
            PipelineOutcome::Completed { batches, events } => {
                info!(job_id = %job_id, batches, events, "任务完成");
                counter!("vigil_worker_jobs_completed").increment(1);
                if let Err(e) = self.queue.ack(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "ack失败");
                }
            }
            PipelineOutcome::Cancelled => {
                // 队列侧已是终态，无需确认
                info!(job_id = %job_id, "任务已取消");
            }
            PipelineOutcome::Failed { reason } => {
                warn!(job_id = %job_id, reason = %reason, "任务失败，交还队列");
                counter!("vigil_worker_jobs_failed").increment(1);
                if let Err(e) = self.queue.nack(&job_id, &reason).await {
                    warn!(job_id = %job_id, error = %e, "nack失败");
                }
            }
        }
    }

    async fn send_heartbeat(&self, worker_id: &str, active_streams: usize) {
        let load = if self.config.max_concurrent_streams == 0 {
            0.0
        } else {
            active_streams as f64 / self.config.max_concurrent_streams as f64
        };
        let heartbeat = WorkerHeartbeat {
            worker_id: worker_id.to_string(),
            load,
            active_jobs: active_streams as u32,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.allocator.heartbeat(heartbeat).await {
            warn!(worker_id = %worker_id, error = %e, "心跳上报失败");
        }
    }
}
