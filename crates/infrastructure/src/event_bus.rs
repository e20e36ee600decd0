use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use vigil_core::{EventBusConfig, VigilError, VigilResult};
use vigil_domain::models::CandidateEvent;
use vigil_domain::ports::{EventBus, EventConsumer};

/// 进程内事件总线实现
///
/// 将Worker管线（生产者）与持久化/告警消费者解耦。发布方按流
/// 路由到专属投递任务，保证同一流的事件对每个消费者按发布顺序
/// 投递；跨流之间无顺序保证。投递失败按指数退避重试，耗尽后
/// 事件进入独立的死信队列（与任务死信队列分离），保留原始负载
/// 供手动重放。
pub struct InProcEventBus {
    config: EventBusConfig,
    consumers: Arc<RwLock<Vec<Arc<dyn EventConsumer>>>>,
    /// 流ID -> 顺序投递通道
    lanes: Mutex<HashMap<String, mpsc::Sender<CandidateEvent>>>,
    dead: Arc<Mutex<Vec<CandidateEvent>>>,
}

impl InProcEventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            consumers: Arc::new(RwLock::new(Vec::new())),
            lanes: Mutex::new(HashMap::new()),
            dead: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 为新出现的流启动顺序投递任务
    async fn lane_for(&self, stream_id: &str) -> mpsc::Sender<CandidateEvent> {
        let mut lanes = self.lanes.lock().await;
        if let Some(tx) = lanes.get(stream_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, mut rx) = mpsc::channel::<CandidateEvent>(self.config.channel_capacity);
        let consumers = Arc::clone(&self.consumers);
        let dead = Arc::clone(&self.dead);
        let config = self.config.clone();
        let stream = stream_id.to_string();

        tokio::spawn(async move {
            debug!(stream_id = %stream, "事件投递通道启动");
            while let Some(event) = rx.recv().await {
                Self::deliver(&consumers, &dead, &config, event).await;
            }
            debug!(stream_id = %stream, "事件投递通道关闭");
        });

        lanes.insert(stream_id.to_string(), tx.clone());
        tx
    }

    /// 向所有消费者投递单个事件，重试耗尽后进入事件死信队列
    async fn deliver(
        consumers: &RwLock<Vec<Arc<dyn EventConsumer>>>,
        dead: &Mutex<Vec<CandidateEvent>>,
        config: &EventBusConfig,
        event: CandidateEvent,
    ) {
        let subscribers = consumers.read().await.clone();
        if subscribers.is_empty() {
            warn!(event_id = %event.id, "无注册消费者，事件进入死信队列");
            counter!("vigil_bus_dead_lettered").increment(1);
            dead.lock().await.push(event);
            return;
        }

        let mut failed = false;
        for consumer in subscribers {
            if !Self::deliver_to_consumer(consumer.as_ref(), config, &event).await {
                failed = true;
            }
        }

        if failed {
            counter!("vigil_bus_dead_lettered").increment(1);
            dead.lock().await.push(event);
        } else {
            counter!("vigil_bus_delivered").increment(1);
        }
    }

    /// 对单个消费者按退避策略重试投递
    async fn deliver_to_consumer(
        consumer: &dyn EventConsumer,
        config: &EventBusConfig,
        event: &CandidateEvent,
    ) -> bool {
        let mut backoff_ms = config.base_backoff_ms;
        for attempt in 1..=config.max_attempts {
            match consumer.handle(event).await {
                Ok(()) => {
                    debug!(
                        event_id = %event.id,
                        consumer = consumer.name(),
                        "事件投递成功"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        event_id = %event.id,
                        consumer = consumer.name(),
                        attempt,
                        error = %e,
                        "事件投递失败"
                    );
                    counter!("vigil_bus_delivery_retries").increment(1);
                    if attempt < config.max_attempts {
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(config.max_backoff_ms);
                    }
                }
            }
        }

        error!(
            event_id = %event.id,
            consumer = consumer.name(),
            attempts = config.max_attempts,
            "事件投递重试耗尽"
        );
        false
    }
}

#[async_trait]
impl EventBus for InProcEventBus {
    async fn publish(&self, event: CandidateEvent) -> VigilResult<()> {
        info!(
            event_id = %event.id,
            event_code = %event.event_code,
            stream_id = %event.stream_id,
            rule_id = %event.rule_id,
            "发布候选事件"
        );
        counter!("vigil_bus_published").increment(1);

        let lane = self.lane_for(&event.stream_id).await;
        lane.send(event)
            .await
            .map_err(|e| VigilError::DeliveryFailure(format!("投递通道已关闭: {e}")))
    }

    async fn subscribe(&self, consumer: Arc<dyn EventConsumer>) -> VigilResult<()> {
        info!(consumer = consumer.name(), "注册事件消费者");
        self.consumers.write().await.push(consumer);
        Ok(())
    }

    async fn dead_letters(&self) -> VigilResult<Vec<CandidateEvent>> {
        Ok(self.dead.lock().await.clone())
    }
}
