use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vigil_core::{ResourceManagerConfig, VigilError, VigilResult};
use vigil_domain::models::{WorkerHeartbeat, WorkerRegistration, WorkerSlot, WorkerStatus};
use vigil_domain::ports::ResourceAllocator;

/// 资源统计快照
#[derive(Debug, Clone, Default)]
pub struct ResourceStats {
    pub registered: usize,
    pub healthy: usize,
    pub free_units: u32,
}

/// GPU资源管理器
///
/// 进程级单一实例，通过引用显式传递给需要的组件，不使用隐藏
/// 单例。跟踪各Worker的GPU容量与健康状态，分配/释放在写锁下
/// 原子完成，分配总量不会超过Worker的总容量。
pub struct GpuResourceManager {
    workers: RwLock<HashMap<String, WorkerSlot>>,
    config: ResourceManagerConfig,
}

impl GpuResourceManager {
    pub fn new(config: ResourceManagerConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 注册Worker；重复注册会重置该Worker的容量记录
    pub async fn register(&self, registration: WorkerRegistration) -> VigilResult<()> {
        if registration.total_units == 0 {
            return Err(VigilError::Configuration(
                "Worker容量必须大于0".to_string(),
            ));
        }
        let slot = WorkerSlot::new(registration);
        info!(
            worker_id = %slot.id,
            hostname = %slot.hostname,
            total_units = slot.total_units,
            "Worker注册"
        );
        self.workers.write().await.insert(slot.id.clone(), slot);
        Ok(())
    }

    /// 注销Worker
    pub async fn deregister(&self, worker_id: &str) -> VigilResult<()> {
        let removed = self.workers.write().await.remove(worker_id);
        match removed {
            Some(_) => {
                info!(worker_id, "Worker注销");
                Ok(())
            }
            None => Err(VigilError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    /// 处理心跳：重置健康计时器，负载超过高水位线时标记为降级
    pub async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> VigilResult<()> {
        let mut workers = self.workers.write().await;
        let slot = workers
            .get_mut(&heartbeat.worker_id)
            .ok_or_else(|| VigilError::WorkerNotFound {
                id: heartbeat.worker_id.clone(),
            })?;

        let was = slot.status;
        slot.update_heartbeat(&heartbeat, self.config.load_high_watermark);
        if was != slot.status {
            info!(
                worker_id = %slot.id,
                old_status = ?was,
                new_status = ?slot.status,
                load = heartbeat.load,
                "Worker健康状态变更"
            );
        }
        Ok(())
    }

    /// 原子的检查并预留：容量不足时返回false且无副作用
    pub async fn try_allocate(&self, worker_id: &str, units: u32) -> VigilResult<bool> {
        let mut workers = self.workers.write().await;
        let slot = workers
            .get_mut(worker_id)
            .ok_or_else(|| VigilError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;

        if !slot.can_fit(units) {
            debug!(
                worker_id,
                units,
                free = slot.free_units(),
                "分配失败：容量不足"
            );
            return Ok(false);
        }

        slot.allocated_units += units;
        slot.active_jobs += 1;
        debug!(
            worker_id,
            units,
            allocated = slot.allocated_units,
            total = slot.total_units,
            "GPU单元已分配"
        );
        Ok(true)
    }

    /// 释放分配；幂等，永不把已分配值降到零以下（越界时钳制并告警）
    pub async fn release(&self, worker_id: &str, units: u32) -> VigilResult<()> {
        let mut workers = self.workers.write().await;
        let Some(slot) = workers.get_mut(worker_id) else {
            // Worker可能已因不可达被清理
            debug!(worker_id, "释放时Worker不存在，忽略");
            return Ok(());
        };

        if units > slot.allocated_units {
            warn!(
                worker_id,
                units,
                allocated = slot.allocated_units,
                "释放超过已分配量，钳制为0"
            );
            slot.allocated_units = 0;
        } else {
            slot.allocated_units -= units;
        }
        slot.active_jobs = slot.active_jobs.saturating_sub(1);
        debug!(
            worker_id,
            allocated = slot.allocated_units,
            "GPU单元已释放"
        );
        Ok(())
    }

    /// 放置策略：在容量足够的Worker中选剩余容量占比最高者
    /// （按百分比的best-fit做负载均衡），平局时选当前任务数最少者
    pub async fn select_worker(&self, units: u32) -> Option<String> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|slot| slot.can_fit(units))
            .max_by(|a, b| {
                a.free_fraction()
                    .partial_cmp(&b.free_fraction())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.active_jobs.cmp(&a.active_jobs))
            })
            .map(|slot| slot.id.clone())
    }

    /// 心跳超时扫描：超时的Worker标记为不可达并强制释放其全部分配
    ///
    /// 返回本次新标记为不可达的Worker ID，调用方负责将其在途任务
    /// 重新入队（按崩溃处理，尝试计数照常递增）。
    pub async fn sweep_unreachable(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = Duration::seconds(self.config.heartbeat_timeout_seconds);
        let mut workers = self.workers.write().await;
        let mut newly_unreachable = Vec::new();

        for slot in workers.values_mut() {
            if slot.status == WorkerStatus::Unreachable {
                continue;
            }
            if now - slot.last_heartbeat > timeout {
                warn!(
                    worker_id = %slot.id,
                    last_heartbeat = %slot.last_heartbeat,
                    "Worker心跳超时，标记为不可达"
                );
                slot.status = WorkerStatus::Unreachable;
                slot.allocated_units = 0;
                slot.active_jobs = 0;
                newly_unreachable.push(slot.id.clone());
            }
        }

        newly_unreachable
    }

    /// 清理长期不可达的Worker记录
    pub async fn cleanup_offline(&self, now: DateTime<Utc>) -> usize {
        let threshold = Duration::seconds(self.config.offline_cleanup_threshold_seconds);
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|_, slot| {
            slot.status != WorkerStatus::Unreachable || now - slot.last_heartbeat <= threshold
        });
        let removed = before - workers.len();
        if removed > 0 {
            info!(removed, "清理长期不可达的Worker");
        }
        removed
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerSlot> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn stats(&self) -> ResourceStats {
        let workers = self.workers.read().await;
        ResourceStats {
            registered: workers.len(),
            healthy: workers
                .values()
                .filter(|s| s.status == WorkerStatus::Healthy)
                .count(),
            free_units: workers
                .values()
                .filter(|s| s.status != WorkerStatus::Unreachable)
                .map(|s| s.free_units())
                .sum(),
        }
    }
}

/// Worker侧通过内部协调通道使用的资源接口
#[async_trait::async_trait]
impl ResourceAllocator for GpuResourceManager {
    async fn register(&self, registration: WorkerRegistration) -> VigilResult<()> {
        GpuResourceManager::register(self, registration).await
    }

    async fn deregister(&self, worker_id: &str) -> VigilResult<()> {
        GpuResourceManager::deregister(self, worker_id).await
    }

    async fn heartbeat(&self, heartbeat: WorkerHeartbeat) -> VigilResult<()> {
        GpuResourceManager::heartbeat(self, heartbeat).await
    }

    async fn try_allocate(&self, worker_id: &str, units: u32) -> VigilResult<bool> {
        GpuResourceManager::try_allocate(self, worker_id, units).await
    }

    async fn release(&self, worker_id: &str, units: u32) -> VigilResult<()> {
        GpuResourceManager::release(self, worker_id, units).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager() -> GpuResourceManager {
        GpuResourceManager::new(ResourceManagerConfig::default())
    }

    fn registration(id: &str, units: u32) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: id.to_string(),
            hostname: format!("host-{id}"),
            total_units: units,
        }
    }

    fn heartbeat(id: &str, load: f64) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: id.to_string(),
            load,
            active_jobs: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_try_allocate_respects_capacity() {
        let rm = manager();
        rm.register(registration("w1", 4)).await.unwrap();

        assert!(rm.try_allocate("w1", 2).await.unwrap());
        assert!(rm.try_allocate("w1", 2).await.unwrap());
        // 容量耗尽，无副作用地返回false
        assert!(!rm.try_allocate("w1", 1).await.unwrap());

        let slot = rm.get_worker("w1").await.unwrap();
        assert_eq!(slot.allocated_units, 4);
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let rm = manager();
        rm.register(registration("w1", 4)).await.unwrap();
        rm.try_allocate("w1", 2).await.unwrap();

        rm.release("w1", 10).await.unwrap();
        let slot = rm.get_worker("w1").await.unwrap();
        assert_eq!(slot.allocated_units, 0);

        // 幂等：重复释放不报错
        rm.release("w1", 2).await.unwrap();
        assert_eq!(rm.get_worker("w1").await.unwrap().allocated_units, 0);
    }

    #[tokio::test]
    async fn test_placement_prefers_highest_free_fraction() {
        let rm = manager();
        rm.register(registration("small", 4)).await.unwrap();
        rm.register(registration("big", 16)).await.unwrap();
        // small: 2/4 已用 (50%空闲)；big: 4/16 已用 (75%空闲)
        rm.try_allocate("small", 2).await.unwrap();
        rm.try_allocate("big", 4).await.unwrap();

        assert_eq!(rm.select_worker(2).await.as_deref(), Some("big"));
    }

    #[tokio::test]
    async fn test_heartbeat_degrades_above_watermark() {
        let rm = manager();
        rm.register(registration("w1", 4)).await.unwrap();

        rm.heartbeat(heartbeat("w1", 0.95)).await.unwrap();
        assert_eq!(
            rm.get_worker("w1").await.unwrap().status,
            WorkerStatus::Degraded
        );

        rm.heartbeat(heartbeat("w1", 0.3)).await.unwrap();
        assert_eq!(
            rm.get_worker("w1").await.unwrap().status,
            WorkerStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker_fails() {
        let rm = manager();
        assert!(matches!(
            rm.heartbeat(heartbeat("ghost", 0.1)).await,
            Err(VigilError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sweep_marks_unreachable_and_releases() {
        let rm = GpuResourceManager::new(ResourceManagerConfig {
            heartbeat_timeout_seconds: 5,
            ..ResourceManagerConfig::default()
        });
        rm.register(registration("w1", 4)).await.unwrap();
        rm.try_allocate("w1", 3).await.unwrap();

        // 心跳仍然新鲜，不会被标记
        assert!(rm.sweep_unreachable(Utc::now()).await.is_empty());

        // 模拟超时
        let future = Utc::now() + Duration::seconds(10);
        let swept = rm.sweep_unreachable(future).await;
        assert_eq!(swept, vec!["w1".to_string()]);

        let slot = rm.get_worker("w1").await.unwrap();
        assert_eq!(slot.status, WorkerStatus::Unreachable);
        assert_eq!(slot.allocated_units, 0);

        // 已标记的Worker不会重复出现
        assert!(rm.sweep_unreachable(future).await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_allocate_never_exceeds_capacity() {
        let rm = Arc::new(manager());
        rm.register(registration("w1", 16)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let rm = Arc::clone(&rm);
            handles.push(tokio::spawn(async move {
                let mut granted = 0u32;
                for _ in 0..8 {
                    if rm.try_allocate("w1", 1).await.unwrap() {
                        granted += 1;
                        tokio::task::yield_now().await;
                        rm.release("w1", 1).await.unwrap();
                    }
                }
                granted
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let slot = rm.get_worker("w1").await.unwrap();
        // 所有分配都已成对释放，且过程中从未超过总量（try_allocate保证）
        assert_eq!(slot.allocated_units, 0);
        assert!(slot.allocated_units <= slot.total_units);
    }
}
