use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use vigil_core::{QueueConfig, VigilError, VigilResult};
use vigil_domain::models::{Job, JobLifecycleEvent, JobPriority, JobState};
use vigil_domain::ports::{QueueStats, TaskQueue};

/// 等待投递的队列条目
#[derive(Debug, Clone)]
struct PendingEntry {
    job: Job,
    /// 原始入队时间，同级内FIFO的排序键
    enqueued_at: DateTime<Utc>,
    /// 退避门槛：在此之前不可投递（nack重新入队时设置）
    eligible_at: DateTime<Utc>,
    /// 老化提升后的有效优先级
    effective_priority: JobPriority,
    /// 已提升的次数
    promotions: u32,
}

/// 已出队、未确认的在途条目
#[derive(Debug, Clone)]
struct InFlightEntry {
    job: Job,
    worker_id: String,
    /// 可见性截止时间，超过后可重新投递给其他Worker
    visibility_deadline: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<PendingEntry>,
    in_flight: HashMap<String, InFlightEntry>,
    /// 终态任务（completed/failed），保留供状态查询，上限之外按完成顺序淘汰
    terminal: HashMap<String, Job>,
    /// 终态任务的进入顺序，淘汰时从最旧的开始
    terminal_order: VecDeque<String>,
    /// 死信队列，只能由操作员手动重新提交
    dead: Vec<Job>,
}

/// 内存任务队列实现
///
/// 提供at-least-once投递：优先级分层、层内FIFO、可见性超时、
/// nack指数退避（含抖动）、老化提升和死信队列。所有出队/确认
/// 操作在单一互斥锁下原子完成，作为跨Worker协调的单一事实源。
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    lifecycle_tx: broadcast::Sender<JobLifecycleEvent>,
}

impl InMemoryTaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (lifecycle_tx, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(QueueState::default()),
            config,
            lifecycle_tx,
        }
    }

    fn notify(&self, job_id: &str, old_state: JobState, new_state: JobState) {
        // 无订阅者时发送失败是正常情况
        let _ = self
            .lifecycle_tx
            .send(JobLifecycleEvent::new(job_id, old_state, new_state));
    }

    /// 计算nack后的重新可投递时间：指数退避加随机抖动
    fn backoff_until(&self, attempt_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = attempt_count.saturating_sub(1).min(16);
        let base = self.config.base_backoff_seconds as f64
            * self.config.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.config.max_backoff_seconds as f64);

        let jitter = if self.config.jitter_factor > 0.0 {
            let mut rng = rand::rng();
            rng.random_range(-self.config.jitter_factor..=self.config.jitter_factor)
        } else {
            0.0
        };
        let delay = (capped * (1.0 + jitter)).max(0.0);

        now + Duration::milliseconds((delay * 1000.0) as i64)
    }

    /// 可见性超时回收：在途超时视为Worker静默死亡，任务重新入队
    fn reclaim_expired(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now > entry.visibility_deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in expired {
            if let Some(entry) = state.in_flight.remove(&job_id) {
                let mut job = entry.job;
                warn!(
                    job_id = %job.id,
                    worker_id = %entry.worker_id,
                    "任务可见性超时，重新入队"
                );
                counter!("vigil_queue_visibility_expired").increment(1);
                let old_state = job.state;
                if job.transition(JobState::Pending) {
                    self.notify(&job.id, old_state, JobState::Pending);
                }
                job.assigned_worker = None;
                state.pending.push(PendingEntry {
                    enqueued_at: job.created_at,
                    // 静默死亡由可见性超时处理，不额外退避
                    eligible_at: now,
                    effective_priority: job.priority,
                    promotions: 0,
                    job,
                });
            }
        }
    }

    /// 老化提升：每等待超过一个阈值周期，提升一个优先级
    fn apply_aging(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let threshold = Duration::seconds(self.config.aging_threshold_seconds);
        for entry in state.pending.iter_mut() {
            let waited = now - entry.enqueued_at;
            let deserved = (waited.num_seconds() / threshold.num_seconds().max(1)) as u32;
            while entry.promotions < deserved
                && entry.effective_priority != JobPriority::High
            {
                entry.effective_priority = entry.effective_priority.promoted();
                entry.promotions += 1;
                debug!(
                    job_id = %entry.job.id,
                    priority = ?entry.effective_priority,
                    "任务老化提升优先级"
                );
            }
            // 已到顶的任务不再重复提升
            if entry.effective_priority == JobPriority::High {
                entry.promotions = entry.promotions.max(deserved);
            }
        }
    }

    /// 终态任务入册，超出保留上限时淘汰最旧的记录
    fn retire(&self, state: &mut QueueState, job: Job) {
        state.terminal_order.push_back(job.id.clone());
        state.terminal.insert(job.id.clone(), job);
        while state.terminal.len() > self.config.terminal_retention {
            match state.terminal_order.pop_front() {
                Some(oldest) => {
                    state.terminal.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn update_gauges(&self, state: &QueueState) {
        gauge!("vigil_queue_pending").set(state.pending.len() as f64);
        gauge!("vigil_queue_in_flight").set(state.in_flight.len() as f64);
        gauge!("vigil_queue_dead_lettered").set(state.dead.len() as f64);
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, job: Job) -> VigilResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        info!(job_id = %job.id, priority = ?job.priority, "任务入队");
        counter!("vigil_queue_enqueued").increment(1);

        state.pending.push(PendingEntry {
            enqueued_at: now,
            eligible_at: now,
            effective_priority: job.priority,
            promotions: 0,
            job,
        });
        self.update_gauges(&state);
        Ok(())
    }

    async fn dequeue(&self, worker_id: &str, capacity_units: u32) -> VigilResult<Option<Job>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        self.reclaim_expired(&mut state, now);
        self.apply_aging(&mut state, now);

        // 严格优先级，层内按原始入队时间FIFO。出队时复核容量：
        // 资源需求超出本Worker总容量的任务留在队列中，等待有
        // 能力的Worker拉取，而不是投递后反复失败烧掉重试次数
        let best = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.eligible_at <= now && e.job.required_units <= capacity_units)
            .max_by(|(_, a), (_, b)| {
                a.effective_priority
                    .cmp(&b.effective_priority)
                    .then_with(|| b.enqueued_at.cmp(&a.enqueued_at))
            })
            .map(|(i, _)| i);

        let Some(index) = best else {
            return Ok(None);
        };

        let mut entry = state.pending.swap_remove(index);
        let old_state = entry.job.state;
        entry.job.attempt_count += 1;
        if !entry.job.transition(JobState::Assigned) {
            // pending集合中不应出现终态任务
            warn!(job_id = %entry.job.id, state = ?entry.job.state, "终态任务滞留pending集合，丢弃");
            return Ok(None);
        }
        entry.job.assigned_worker = Some(worker_id.to_string());

        let job = entry.job.clone();
        self.notify(&job.id, old_state, JobState::Assigned);
        info!(
            job_id = %job.id,
            worker_id,
            attempt = job.attempt_count,
            "任务出队"
        );
        counter!("vigil_queue_dequeued").increment(1);

        state.in_flight.insert(
            job.id.clone(),
            InFlightEntry {
                job: job.clone(),
                worker_id: worker_id.to_string(),
                visibility_deadline: now
                    + Duration::seconds(self.config.visibility_timeout_seconds),
            },
        );
        self.update_gauges(&state);
        Ok(Some(job))
    }

    async fn start(&self, job_id: &str) -> VigilResult<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .in_flight
            .get_mut(job_id)
            .ok_or_else(|| VigilError::JobNotFound {
                id: job_id.to_string(),
            })?;
        let old_state = entry.job.state;
        if entry.job.transition(JobState::Processing) {
            self.notify(job_id, old_state, JobState::Processing);
        }
        Ok(())
    }

    async fn ack(&self, job_id: &str) -> VigilResult<()> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.in_flight.remove(job_id) else {
            // 任务可能已被取消或可见性超时回收
            debug!(job_id, "ack时任务不在在途集合中，忽略");
            return Ok(());
        };

        let mut job = entry.job;
        let old_state = job.state;
        if job.transition(JobState::Completed) {
            self.notify(job_id, old_state, JobState::Completed);
        }
        job.assigned_worker = None;
        info!(job_id, "任务完成确认");
        counter!("vigil_queue_acked").increment(1);

        self.retire(&mut state, job);
        self.update_gauges(&state);
        Ok(())
    }

    async fn nack(&self, job_id: &str, reason: &str) -> VigilResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(entry) = state.in_flight.remove(job_id) else {
            debug!(job_id, "nack时任务不在在途集合中，忽略");
            return Ok(());
        };

        let mut job = entry.job;
        let old_state = job.state;
        job.assigned_worker = None;
        job.last_failure = Some(reason.to_string());

        if job.attempt_count >= self.config.max_attempts {
            if job.transition(JobState::DeadLettered) {
                self.notify(job_id, old_state, JobState::DeadLettered);
            }
            warn!(
                job_id,
                attempts = job.attempt_count,
                reason,
                "任务重试耗尽，进入死信队列"
            );
            counter!("vigil_queue_dead_lettered").increment(1);
            state.dead.push(job);
        } else {
            let eligible_at = self.backoff_until(job.attempt_count, now);
            if job.transition(JobState::Pending) {
                self.notify(job_id, old_state, JobState::Pending);
            }
            info!(
                job_id,
                attempt = job.attempt_count,
                reason,
                eligible_at = %eligible_at,
                "任务nack，退避后重新入队"
            );
            counter!("vigil_queue_nacked").increment(1);
            state.pending.push(PendingEntry {
                enqueued_at: job.created_at,
                eligible_at,
                effective_priority: job.priority,
                promotions: 0,
                job,
            });
        }
        self.update_gauges(&state);
        Ok(())
    }

    async fn cancel(&self, job_id: &str) -> VigilResult<()> {
        let mut state = self.state.lock().await;

        // pending中的任务直接取消
        if let Some(index) = state.pending.iter().position(|e| e.job.id == job_id) {
            let mut entry = state.pending.swap_remove(index);
            let old_state = entry.job.state;
            if entry.job.transition(JobState::Failed) {
                self.notify(job_id, old_state, JobState::Failed);
            }
            entry.job.last_failure = Some("cancelled".to_string());
            info!(job_id, "pending任务已取消");
            self.retire(&mut state, entry.job);
            self.update_gauges(&state);
            return Ok(());
        }

        // 在途任务：标记终态，Worker在下一批次边界观察到后停止投喂
        if let Some(entry) = state.in_flight.remove(job_id) {
            let mut job = entry.job;
            let old_state = job.state;
            if job.transition(JobState::Failed) {
                self.notify(job_id, old_state, JobState::Failed);
            }
            job.last_failure = Some("cancelled".to_string());
            job.assigned_worker = None;
            info!(job_id, "在途任务已取消");
            self.retire(&mut state, job);
            self.update_gauges(&state);
            return Ok(());
        }

        // 终态任务取消为no-op
        if state.terminal.contains_key(job_id) || state.dead.iter().any(|j| j.id == job_id) {
            debug!(job_id, "取消终态任务，no-op");
            return Ok(());
        }

        Err(VigilError::JobNotFound {
            id: job_id.to_string(),
        })
    }

    async fn get_job(&self, job_id: &str) -> VigilResult<Option<Job>> {
        let state = self.state.lock().await;
        if let Some(entry) = state.pending.iter().find(|e| e.job.id == job_id) {
            return Ok(Some(entry.job.clone()));
        }
        if let Some(entry) = state.in_flight.get(job_id) {
            return Ok(Some(entry.job.clone()));
        }
        if let Some(job) = state.terminal.get(job_id) {
            return Ok(Some(job.clone()));
        }
        if let Some(job) = state.dead.iter().find(|j| j.id == job_id) {
            return Ok(Some(job.clone()));
        }
        Ok(None)
    }

    async fn requeue_inflight(&self, worker_id: &str) -> VigilResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let held: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, e)| e.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();

        for job_id in &held {
            if let Some(entry) = state.in_flight.remove(job_id) {
                let mut job = entry.job;
                let old_state = job.state;
                if job.transition(JobState::Pending) {
                    self.notify(job_id, old_state, JobState::Pending);
                }
                job.assigned_worker = None;
                state.pending.push(PendingEntry {
                    enqueued_at: job.created_at,
                    eligible_at: now,
                    effective_priority: job.priority,
                    promotions: 0,
                    job,
                });
            }
        }

        if !held.is_empty() {
            warn!(worker_id, count = held.len(), "Worker失效，在途任务已重新入队");
            counter!("vigil_queue_requeued_on_failure").increment(held.len() as u64);
        }
        self.update_gauges(&state);
        Ok(held)
    }

    async fn dead_letters(&self) -> VigilResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state.dead.clone())
    }

    async fn resubmit(&self, job_id: &str) -> VigilResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(index) = state.dead.iter().position(|j| j.id == job_id) else {
            return Err(VigilError::JobNotFound {
                id: job_id.to_string(),
            });
        };

        let mut job = state.dead.swap_remove(index);
        let old_state = job.state;
        if job.resubmit() {
            self.notify(job_id, old_state, JobState::Pending);
        }
        info!(job_id, "死信任务由操作员重新提交");
        counter!("vigil_queue_resubmitted").increment(1);

        state.pending.push(PendingEntry {
            enqueued_at: now,
            eligible_at: now,
            effective_priority: job.priority,
            promotions: 0,
            job,
        });
        self.update_gauges(&state);
        Ok(())
    }

    async fn stats(&self) -> VigilResult<QueueStats> {
        let state = self.state.lock().await;
        let tier = |p: JobPriority| {
            state
                .pending
                .iter()
                .filter(|e| e.effective_priority == p)
                .count()
        };
        Ok(QueueStats {
            pending: state.pending.len(),
            pending_high: tier(JobPriority::High),
            pending_normal: tier(JobPriority::Normal),
            pending_low: tier(JobPriority::Low),
            in_flight: state.in_flight.len(),
            dead_lettered: state.dead.len(),
        })
    }

    fn subscribe_lifecycle(&self) -> broadcast::Receiver<JobLifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }
}
