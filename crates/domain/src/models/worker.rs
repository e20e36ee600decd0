use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 已注册的GPU Worker节点及其容量信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub id: String,
    pub hostname: String,
    /// GPU总容量（计算单元）
    pub total_units: u32,
    /// 当前已分配的计算单元
    pub allocated_units: u32,
    /// 当前持有的任务数
    pub active_jobs: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Worker健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "UNREACHABLE")]
    Unreachable,
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub total_units: u32,
}

/// Worker心跳信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    /// 当前负载（0.0-1.0）
    pub load: f64,
    pub active_jobs: u32,
    pub timestamp: DateTime<Utc>,
}

impl WorkerSlot {
    /// 根据注册请求创建Worker记录
    pub fn new(registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.worker_id,
            hostname: registration.hostname,
            total_units: registration.total_units,
            allocated_units: 0,
            active_jobs: 0,
            status: WorkerStatus::Healthy,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// 剩余可分配的计算单元
    pub fn free_units(&self) -> u32 {
        self.total_units.saturating_sub(self.allocated_units)
    }

    /// 剩余容量占比（0.0-1.0），用于best-fit放置
    pub fn free_fraction(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            self.free_units() as f64 / self.total_units as f64
        }
    }

    /// 是否可以承接指定资源需求的任务
    pub fn can_fit(&self, units: u32) -> bool {
        self.status != WorkerStatus::Unreachable && self.free_units() >= units
    }

    /// 更新心跳；负载超过高水位线时标记为降级
    pub fn update_heartbeat(&mut self, heartbeat: &WorkerHeartbeat, high_watermark: f64) {
        self.last_heartbeat = heartbeat.timestamp;
        self.active_jobs = heartbeat.active_jobs;
        self.status = if heartbeat.load > high_watermark {
            WorkerStatus::Degraded
        } else {
            WorkerStatus::Healthy
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(total: u32, allocated: u32) -> WorkerSlot {
        let mut s = WorkerSlot::new(WorkerRegistration {
            worker_id: "w1".to_string(),
            hostname: "host-a".to_string(),
            total_units: total,
        });
        s.allocated_units = allocated;
        s
    }

    #[test]
    fn test_free_units_and_fraction() {
        let s = slot(4, 1);
        assert_eq!(s.free_units(), 3);
        assert!((s.free_fraction() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_can_fit_respects_capacity_and_health() {
        let mut s = slot(4, 3);
        assert!(s.can_fit(1));
        assert!(!s.can_fit(2));
        s.status = WorkerStatus::Unreachable;
        assert!(!s.can_fit(1));
    }

    #[test]
    fn test_heartbeat_marks_degraded_above_watermark() {
        let mut s = slot(4, 0);
        let hb = WorkerHeartbeat {
            worker_id: "w1".to_string(),
            load: 0.95,
            active_jobs: 2,
            timestamp: Utc::now(),
        };
        s.update_heartbeat(&hb, 0.9);
        assert_eq!(s.status, WorkerStatus::Degraded);

        let hb = WorkerHeartbeat {
            load: 0.5,
            timestamp: Utc::now(),
            ..hb
        };
        s.update_heartbeat(&hb, 0.9);
        assert_eq!(s.status, WorkerStatus::Healthy);
    }
}
