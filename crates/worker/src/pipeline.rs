use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_core::{PipelineConfig, VigilError, VigilResult};
use vigil_domain::models::{Frame, Job, Rule, Track};
use vigil_domain::ports::{Detector, EventBus, FrameSource, ResourceAllocator, TaskQueue};

use crate::batcher::{FrameBatcher, FrameSampler};
use crate::clip::ClipExtractor;
use crate::rules::RuleEngine;
use crate::tracker::IouTracker;

/// 单个任务流水线的最终结局
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// 片段处理完毕
    Completed { batches: u64, events: u64 },
    /// 任务在处理中被取消
    Cancelled,
    /// 不可恢复失败，携带原因供nack
    Failed { reason: String },
}

/// 单视频流处理流水线：采样 → 组批 → 推理 → 跟踪 → 规则 → 发布
///
/// 每个任务独占一条流水线实例，跟踪器与规则触发状态互不共享。
/// 单批次失败跳过该批次继续处理，连续失败达到阈值才放弃整个
/// 任务；GPU计算单元在每次推理调用前后申请与归还。
pub struct StreamPipeline {
    job: Job,
    worker_id: String,
    config: PipelineConfig,
    max_consecutive_failures: u32,
    detector: Arc<dyn Detector>,
    allocator: Arc<dyn ResourceAllocator>,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<dyn EventBus>,
    frame_source: Arc<dyn FrameSource>,
    rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
}

impl StreamPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Job,
        worker_id: &str,
        config: PipelineConfig,
        max_consecutive_failures: u32,
        detector: Arc<dyn Detector>,
        allocator: Arc<dyn ResourceAllocator>,
        queue: Arc<dyn TaskQueue>,
        bus: Arc<dyn EventBus>,
        frame_source: Arc<dyn FrameSource>,
        rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
    ) -> Self {
        Self {
            job,
            worker_id: worker_id.to_string(),
            config,
            max_consecutive_failures,
            detector,
            allocator,
            queue,
            bus,
            frame_source,
            rules_rx,
        }
    }

    /// 运行流水线直至片段结束、取消或失败
    pub async fn run(self) -> PipelineOutcome {
        info!(
            job_id = %self.job.id,
            stream_id = %self.job.stream_id,
            segment_ref = %self.job.segment_ref,
            attempt = self.job.attempt_count,
            "流水线启动"
        );

        let mut stream = match self.frame_source.open(&self.job.segment_ref).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(job_id = %self.job.id, error = %e, "帧源打开失败");
                return PipelineOutcome::Failed {
                    reason: format!("帧源打开失败: {e}"),
                };
            }
        };

        let batcher = FrameBatcher::new(&self.config);
        let mut sampler = FrameSampler::new(&self.config);
        let mut tracker = IouTracker::new(&self.job.stream_id, &self.config);
        let mut engine = RuleEngine::new(self.rules_rx.clone());
        let clipper = ClipExtractor::new(self.config.clip_padding_seconds);

        let mut segment_start: Option<DateTime<Utc>> = None;
        let mut consecutive_failures = 0u32;
        let mut batches = 0u64;
        let mut events_total = 0u64;

        loop {
            // 批次边界检查取消：队列侧已进入终态则停止拉帧
            match self.queue.get_job(&self.job.id).await {
                Ok(Some(current)) if current.state.is_terminal() => {
                    info!(job_id = %self.job.id, state = ?current.state, "任务已终止，流水线退出");
                    return PipelineOutcome::Cancelled;
                }
                _ => {}
            }

            let (batch, end_of_stream) =
                match batcher.next_batch(stream.as_mut(), &mut sampler).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(job_id = %self.job.id, error = %e, "帧读取失败");
                        return PipelineOutcome::Failed {
                            reason: format!("帧读取失败: {e}"),
                        };
                    }
                };

            if !batch.is_empty() {
                if segment_start.is_none() {
                    segment_start = batch.first().map(|f| f.timestamp);
                }
                batches += 1;
                let segment_begin = segment_start.unwrap_or_else(Utc::now);

                match self
                    .process_batch(
                        &batch,
                        segment_begin,
                        &mut tracker,
                        &mut engine,
                        &clipper,
                        &mut sampler,
                    )
                    .await
                {
                    Ok(published) => {
                        consecutive_failures = 0;
                        events_total += published;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        counter!("vigil_pipeline_batch_failures").increment(1);
                        warn!(
                            job_id = %self.job.id,
                            error = %e,
                            consecutive_failures,
                            "批次处理失败，跳过该批次"
                        );
                        if consecutive_failures >= self.max_consecutive_failures {
                            return PipelineOutcome::Failed {
                                reason: format!(
                                    "连续{consecutive_failures}个批次失败，最近错误: {e}"
                                ),
                            };
                        }
                    }
                }
            }

            if end_of_stream {
                info!(
                    job_id = %self.job.id,
                    batches,
                    events = events_total,
                    tracks = tracker.len(),
                    "片段处理完毕"
                );
                return PipelineOutcome::Completed {
                    batches,
                    events: events_total,
                };
            }
        }
    }

    /// 处理一个批次，返回发布的事件数
    async fn process_batch(
        &self,
        batch: &[Frame],
        segment_start: DateTime<Utc>,
        tracker: &mut IouTracker,
        engine: &mut RuleEngine,
        clipper: &ClipExtractor,
        sampler: &mut FrameSampler,
    ) -> VigilResult<u64> {
        let units = self.job.required_units;
        if !self.allocator.try_allocate(&self.worker_id, units).await? {
            return Err(VigilError::CapacityUnavailable(format!(
                "worker {} 无法预留 {units} 个计算单元",
                self.worker_id
            )));
        }

        // 推理带硬超时；无论成败都归还计算单元
        let timeout = Duration::from_millis(self.config.inference_timeout_ms);
        let inference = tokio::time::timeout(timeout, self.detector.detect(batch)).await;
        self.allocator.release(&self.worker_id, units).await?;

        let per_frame = match inference {
            Err(_) => {
                return Err(VigilError::InferenceTimeout {
                    timeout_ms: self.config.inference_timeout_ms,
                })
            }
            Ok(result) => result?,
        };

        for detections in per_frame.into_iter().take(batch.len()) {
            tracker.update(detections);
        }
        let summary = tracker.end_batch();
        for track_id in &summary.evicted {
            engine.forget_track(*track_id);
        }

        // 规则热更新在批次边界生效；本批次刚转为lost的轨迹
        // 仍参与评估以便闭合事件
        engine.refresh();
        let mut candidates: Vec<&Track> = tracker.active_tracks().collect();
        for track_id in &summary.newly_lost {
            if let Some(track) = tracker.get(*track_id) {
                candidates.push(track);
            }
        }
        let fired = engine.evaluate(&candidates);

        let segment_end = batch
            .last()
            .map(|f| f.timestamp)
            .unwrap_or_else(Utc::now);
        let mut published = 0u64;
        for mut event in fired {
            let clip = clipper.extract(&event, segment_start, segment_end);
            event.clip_ref = Some(clip.clip_ref);
            sampler.note_event(event.window_end);
            debug!(
                event_id = %event.id,
                event_code = %event.event_code,
                stream_id = %event.stream_id,
                "发布候选事件"
            );
            self.bus.publish(event).await?;
            counter!("vigil_events_published").increment(1);
            published += 1;
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::ResourceManagerConfig;
    use vigil_domain::models::{JobPriority, JobRequest, WorkerRegistration};
    use vigil_domain::ports::TaskQueue as _;
    use vigil_infrastructure::{InMemoryTaskQueue, InProcEventBus, SyntheticDetector, SyntheticFrameSource};
    use vigil_orchestrator::GpuResourceManager;

    use std::sync::Mutex;

    struct Recording {
        events: Mutex<Vec<vigil_domain::models::CandidateEvent>>,
    }

    #[async_trait::async_trait]
    impl vigil_domain::ports::EventConsumer for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(
            &self,
            event: &vigil_domain::models::CandidateEvent,
        ) -> VigilResult<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 4,
            batch_max_wait_ms: 100,
            inference_timeout_ms: 2000,
            iou_threshold: 0.1,
            ..Default::default()
        }
    }

    fn job() -> Job {
        Job::new(
            JobRequest {
                stream_id: "cam-01".to_string(),
                segment_ref: "segment://cam-01/0001".to_string(),
                priority: JobPriority::Normal,
                required_units: 2,
            },
            300,
        )
    }

    async fn resources() -> Arc<GpuResourceManager> {
        let rm = Arc::new(GpuResourceManager::new(ResourceManagerConfig::default()));
        rm.register(WorkerRegistration {
            worker_id: "w1".to_string(),
            hostname: "test".to_string(),
            total_units: 4,
        })
        .await
        .unwrap();
        rm
    }

    fn always_rule() -> Rule {
        Rule {
            id: "r1".to_string(),
            name: "any-person".to_string(),
            event_code: "intrusion".to_string(),
            target_classes: vec![],
            confidence_threshold: 0.5,
            conditions: vec![],
            active: true,
        }
    }

    #[tokio::test]
    async fn test_pipeline_completes_and_publishes_events() {
        let queue = Arc::new(InMemoryTaskQueue::new(Default::default()));
        let bus = Arc::new(InProcEventBus::new(Default::default()));
        let consumer = Arc::new(Recording {
            events: Mutex::new(Vec::new()),
        });
        vigil_domain::ports::EventBus::subscribe(bus.as_ref(), consumer.clone())
            .await
            .unwrap();

        let rm = resources().await;
        let (_rules_tx, rules_rx) = watch::channel(Arc::new(vec![always_rule()]));

        let job = job();
        queue.enqueue(job.clone()).await.unwrap();
        let dequeued = queue.dequeue("w1", 4).await.unwrap().unwrap();
        queue.start(&dequeued.id).await.unwrap();

        let pipeline = StreamPipeline::new(
            dequeued,
            "w1",
            pipeline_config(),
            3,
            Arc::new(SyntheticDetector::new("person", 0.9)),
            rm.clone(),
            queue.clone(),
            bus.clone(),
            Arc::new(SyntheticFrameSource::default()),
            rules_rx,
        );

        let outcome = pipeline.run().await;
        match outcome {
            PipelineOutcome::Completed { batches, events } => {
                assert!(batches > 0);
                assert!(events >= 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // 推理结束后计算单元应全部归还
        let stats = rm.stats().await;
        assert_eq!(stats.free_units, 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let received = consumer.events.lock().unwrap();
        assert!(!received.is_empty());
        assert!(received[0].clip_ref.is_some());
    }

    #[tokio::test]
    async fn test_consecutive_inference_failures_abort_job() {
        let queue = Arc::new(InMemoryTaskQueue::new(Default::default()));
        let bus = Arc::new(InProcEventBus::new(Default::default()));
        let rm = resources().await;
        let (_rules_tx, rules_rx) = watch::channel(Arc::new(Vec::new()));

        let pipeline = StreamPipeline::new(
            job(),
            "w1",
            pipeline_config(),
            2,
            // 每次调用都失败
            Arc::new(SyntheticDetector::new("person", 0.9).with_failure_injection(1)),
            rm.clone(),
            queue,
            bus,
            Arc::new(SyntheticFrameSource::default()),
            rules_rx,
        );

        let outcome = pipeline.run().await;
        assert!(matches!(outcome, PipelineOutcome::Failed { .. }));

        // 失败路径上计算单元同样归还
        assert_eq!(rm.stats().await.free_units, 4);
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_at_batch_boundary() {
        let queue = Arc::new(InMemoryTaskQueue::new(Default::default()));
        let bus = Arc::new(InProcEventBus::new(Default::default()));
        let rm = resources().await;
        let (_rules_tx, rules_rx) = watch::channel(Arc::new(Vec::new()));

        let job = job();
        queue.enqueue(job.clone()).await.unwrap();
        let dequeued = queue.dequeue("w1", 4).await.unwrap().unwrap();
        // 出队后立即取消
        queue.cancel(&dequeued.id).await.unwrap();

        let pipeline = StreamPipeline::new(
            dequeued,
            "w1",
            pipeline_config(),
            3,
            Arc::new(SyntheticDetector::new("person", 0.9)),
            rm,
            queue,
            bus,
            Arc::new(SyntheticFrameSource::default()),
            rules_rx,
        );

        assert_eq!(pipeline.run().await, PipelineOutcome::Cancelled);
    }
}
