use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use vigil_core::{AppConfig, VigilResult};
use vigil_domain::models::{CandidateEvent, Rule};
use vigil_domain::ports::{EventBus, EventConsumer, TaskQueue};
use vigil_infrastructure::{
    InMemoryTaskQueue, InProcEventBus, SyntheticDetector, SyntheticFrameSource,
};
use vigil_orchestrator::{GpuResourceManager, JobOrchestrator, WorkerFailureDetector};
use vigil_worker::WorkerService;

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 仅运行编排侧（队列、资源管理、失效检测）
    Orchestrator,
    /// 仅运行Worker
    Worker,
    /// 单进程运行所有组件
    All,
}

/// 把候选事件写入结构化日志的下游消费者
struct LoggingConsumer;

#[async_trait]
impl EventConsumer for LoggingConsumer {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, event: &CandidateEvent) -> VigilResult<()> {
        info!(
            event_id = %event.id,
            event_code = %event.event_code,
            stream_id = %event.stream_id,
            rule_id = %event.rule_id,
            confidence = event.confidence,
            clip_ref = event.clip_ref.as_deref().unwrap_or("-"),
            "候选事件"
        );
        Ok(())
    }
}

/// 主应用程序
///
/// 队列、事件总线与资源管理器为进程级单一实例，显式传递给
/// 各组件；规则集经watch通道下发，持有发送端以支持热更新。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    queue: Arc<InMemoryTaskQueue>,
    bus: Arc<InProcEventBus>,
    resources: Arc<GpuResourceManager>,
    orchestrator: Arc<JobOrchestrator>,
    rules_tx: watch::Sender<Arc<Vec<Rule>>>,
    rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode, rules: Vec<Rule>) -> Result<Self> {
        info!(mode = ?mode, rules = rules.len(), "初始化应用程序");

        let queue = Arc::new(InMemoryTaskQueue::new(config.queue.clone()));
        let bus = Arc::new(InProcEventBus::new(config.event_bus.clone()));
        let resources = Arc::new(GpuResourceManager::new(config.resource_manager.clone()));
        let orchestrator = Arc::new(JobOrchestrator::new(
            queue.clone() as Arc<dyn TaskQueue>,
            resources.clone(),
            config.orchestrator.clone(),
        ));
        let (rules_tx, rules_rx) = watch::channel(Arc::new(rules));

        bus.subscribe(Arc::new(LoggingConsumer))
            .await
            .context("注册日志事件消费者失败")?;

        Ok(Self {
            config,
            mode,
            queue,
            bus,
            resources,
            orchestrator,
            rules_tx,
            rules_rx,
        })
    }

    /// 热更新规则集，批次边界对全部在途流水线生效
    pub fn swap_rules(&self, rules: Vec<Rule>) {
        info!(rules = rules.len(), "下发新规则集");
        if self.rules_tx.send(Arc::new(rules)).is_err() {
            warn!("规则热更新失败：没有存活的接收端");
        }
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(mode = ?self.mode, "启动应用程序");
        match self.mode {
            AppMode::Orchestrator => self.run_orchestrator(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::All => self.run_all(shutdown_rx).await,
        }
    }

    /// 编排侧：失效检测循环 + 生命周期通知日志
    async fn run_orchestrator(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let detector = WorkerFailureDetector::new(
            self.resources.clone(),
            self.queue.clone() as Arc<dyn TaskQueue>,
            self.config.resource_manager.clone(),
        );

        let lifecycle_handle = {
            let mut lifecycle_rx = self.orchestrator.subscribe_lifecycle();
            let mut shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        event = lifecycle_rx.recv() => match event {
                            Ok(event) => info!(
                                job_id = %event.job_id,
                                old_state = ?event.old_state,
                                new_state = ?event.new_state,
                                "任务状态迁移"
                            ),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "生命周期通知消费滞后")
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        let stats_handle = {
            let orchestrator = self.orchestrator.clone();
            let mut shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = tick.tick() => match orchestrator.stats().await {
                            Ok(stats) => info!(
                                pending = stats.queue.pending,
                                pending_high = stats.queue.pending_high,
                                in_flight = stats.queue.in_flight,
                                dead_lettered = stats.queue.dead_lettered,
                                workers = stats.resources.registered,
                                healthy = stats.resources.healthy,
                                free_units = stats.resources.free_units,
                                "系统状态"
                            ),
                            Err(e) => warn!(error = %e, "统计快照获取失败"),
                        },
                    }
                }
            })
        };

        detector
            .run(shutdown_rx)
            .await
            .context("失效检测循环退出异常")?;

        let _ = lifecycle_handle.await;
        let _ = stats_handle.await;
        Ok(())
    }

    /// Worker侧：注册、心跳、拉取任务并运行流水线
    async fn run_worker(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let service = WorkerService::new(
            self.config.worker.clone(),
            self.config.pipeline.clone(),
            self.queue.clone() as Arc<dyn TaskQueue>,
            self.bus.clone() as Arc<dyn EventBus>,
            self.resources.clone(),
            Arc::new(SyntheticDetector::new("person", 0.9)),
            Arc::new(SyntheticFrameSource::default()),
            self.rules_rx.clone(),
        );
        service.run(shutdown_rx).await.context("Worker服务退出异常")
    }

    /// 单进程运行全部组件
    async fn run_all(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let orchestrator_handle = {
            let detector = WorkerFailureDetector::new(
                self.resources.clone(),
                self.queue.clone() as Arc<dyn TaskQueue>,
                self.config.resource_manager.clone(),
            );
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                if let Err(e) = detector.run(shutdown_rx).await {
                    warn!(error = %e, "失效检测循环退出异常");
                }
            })
        };

        self.run_worker(shutdown_rx).await?;
        let _ = orchestrator_handle.await;
        Ok(())
    }
}
