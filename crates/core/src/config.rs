use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 系统配置
///
/// 加载顺序:
/// 1. 默认配置
/// 2. 配置文件 (TOML格式)
/// 3. 环境变量覆盖 (前缀: VIGIL__)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub orchestrator: OrchestratorConfig,
    pub resource_manager: ResourceManagerConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub pipeline: PipelineConfig,
    pub event_bus: EventBusConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            resource_manager: ResourceManagerConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            pipeline: PipelineConfig::default(),
            event_bus: EventBusConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// 编排器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub enabled: bool,
    /// 任务生命周期通知通道容量
    pub lifecycle_channel_capacity: usize,
    /// 近实时SLA的默认截止时间（秒）
    pub default_deadline_seconds: i64,
    /// 提交请求未声明资源需求时使用的GPU计算单元数
    pub default_required_units: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lifecycle_channel_capacity: 256,
            default_deadline_seconds: 300,
            default_required_units: 2,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lifecycle_channel_capacity == 0 {
            return Err(anyhow::anyhow!("生命周期通道容量必须大于0"));
        }
        if self.default_deadline_seconds <= 0 {
            return Err(anyhow::anyhow!("默认截止时间必须大于0"));
        }
        if self.default_required_units == 0 {
            return Err(anyhow::anyhow!("默认任务资源需求必须大于0"));
        }
        Ok(())
    }
}

/// GPU资源管理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// 心跳超时时间（秒），超时后Worker标记为不可达
    pub heartbeat_timeout_seconds: i64,
    /// 失效检测扫描间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 负载高水位线（0.0-1.0），超过后Worker标记为降级
    pub load_high_watermark: f64,
    /// 不可达Worker的清理阈值（秒）
    pub offline_cleanup_threshold_seconds: i64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            sweep_interval_seconds: 30,
            load_high_watermark: 0.9,
            offline_cleanup_threshold_seconds: 300,
        }
    }
}

impl ResourceManagerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(anyhow::anyhow!("失效检测间隔必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.load_high_watermark) {
            return Err(anyhow::anyhow!(
                "负载高水位线必须在0.0-1.0之间: {}",
                self.load_high_watermark
            ));
        }
        Ok(())
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 最大尝试次数，超过后进入死信队列
    pub max_attempts: u32,
    /// 可见性超时（秒）：出队未确认的任务在此后可被重新投递
    pub visibility_timeout_seconds: i64,
    /// 老化阈值（秒）：等待超过此时间的任务提升一个优先级
    pub aging_threshold_seconds: i64,
    /// nack后的基础退避间隔（秒）
    pub base_backoff_seconds: u64,
    /// 最大退避间隔（秒）
    pub max_backoff_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 退避随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 终态任务的保留数量上限，超出后按完成顺序淘汰最旧的记录
    pub terminal_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            visibility_timeout_seconds: 60,
            aging_threshold_seconds: 120,
            base_backoff_seconds: 2,
            max_backoff_seconds: 60,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            terminal_retention: 4096,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("最大尝试次数必须大于0"));
        }
        if self.visibility_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("可见性超时必须大于0"));
        }
        if self.aging_threshold_seconds <= 0 {
            return Err(anyhow::anyhow!("老化阈值必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数必须大于等于1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动范围必须在0.0-1.0之间: {}",
                self.jitter_factor
            ));
        }
        if self.terminal_retention == 0 {
            return Err(anyhow::anyhow!("终态保留数量必须大于0"));
        }
        Ok(())
    }
}

/// Worker配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub hostname: String,
    /// GPU总容量（计算单元）
    pub capacity_units: u32,
    /// 心跳间隔（秒）
    pub heartbeat_interval_seconds: u64,
    /// 队列轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 最大并发流数
    pub max_concurrent_streams: usize,
    /// 连续批次失败阈值，超过后nack所属任务
    pub max_consecutive_batch_failures: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_id: "worker-001".to_string(),
            hostname: "localhost".to_string(),
            capacity_units: 4,
            heartbeat_interval_seconds: 10,
            poll_interval_ms: 500,
            max_concurrent_streams: 8,
            max_consecutive_batch_failures: 3,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }
        if self.capacity_units == 0 {
            return Err(anyhow::anyhow!("GPU容量必须大于0"));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }
        if self.max_concurrent_streams == 0 {
            return Err(anyhow::anyhow!("最大并发流数必须大于0"));
        }
        if self.max_consecutive_batch_failures == 0 {
            return Err(anyhow::anyhow!("连续失败阈值必须大于0"));
        }
        Ok(())
    }
}

/// 流处理管线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 基础采样率（每秒帧数）
    pub base_sample_fps: u32,
    /// 检测到事件后的突发采样率（每秒帧数）
    pub burst_sample_fps: u32,
    /// 突发采样冷却时间（秒）
    pub burst_cooldown_seconds: u64,
    /// 批次大小
    pub batch_size: usize,
    /// 批次最大等待时间（毫秒）
    pub batch_max_wait_ms: u64,
    /// 单批次推理硬超时（毫秒）
    pub inference_timeout_ms: u64,
    /// 跟踪匹配的IoU阈值
    pub iou_threshold: f64,
    /// 连续丢失多少帧后轨迹转为lost
    pub max_track_misses: u32,
    /// lost轨迹保留的批次数（事件闭合用），之后驱逐
    pub lost_track_retention: u32,
    /// 事件片段前后填充（秒）
    pub clip_padding_seconds: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_sample_fps: 5,
            burst_sample_fps: 15,
            burst_cooldown_seconds: 10,
            batch_size: 8,
            batch_max_wait_ms: 200,
            inference_timeout_ms: 2000,
            iou_threshold: 0.3,
            max_track_misses: 5,
            lost_track_retention: 3,
            clip_padding_seconds: 5.0,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base_sample_fps == 0 {
            return Err(anyhow::anyhow!("基础采样率必须大于0"));
        }
        if self.burst_sample_fps < self.base_sample_fps {
            return Err(anyhow::anyhow!(
                "突发采样率不能低于基础采样率: {} < {}",
                self.burst_sample_fps,
                self.base_sample_fps
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("批次大小必须大于0"));
        }
        if self.batch_max_wait_ms == 0 {
            return Err(anyhow::anyhow!("批次最大等待时间必须大于0"));
        }
        if self.inference_timeout_ms == 0 {
            return Err(anyhow::anyhow!("推理超时必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow::anyhow!(
                "IoU阈值必须在0.0-1.0之间: {}",
                self.iou_threshold
            ));
        }
        if self.max_track_misses == 0 {
            return Err(anyhow::anyhow!("轨迹丢失阈值必须大于0"));
        }
        if self.clip_padding_seconds < 0.0 {
            return Err(anyhow::anyhow!("片段填充时间不能为负"));
        }
        Ok(())
    }
}

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// 每个流的投递通道容量
    pub channel_capacity: usize,
    /// 单个事件的最大投递尝试次数
    pub max_attempts: u32,
    /// 投递重试基础退避（毫秒）
    pub base_backoff_ms: u64,
    /// 投递重试最大退避（毫秒）
    pub max_backoff_ms: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 128,
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl EventBusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("投递通道容量必须大于0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("最大投递尝试次数必须大于0"));
        }
        Ok(())
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String, // "json" 或 "pretty"
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// # Arguments
    ///
    /// * `config_path` - 配置文件路径，None时尝试默认路径
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/vigil.toml", "vigil.toml", "/etc/vigil/config.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        // 环境变量覆盖（前缀: VIGIL__，如 VIGIL__QUEUE__MAX_ATTEMPTS）
        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// 从TOML字符串加载配置
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为TOML字符串
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 校验配置有效性
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        self.resource_manager.validate()?;
        self.queue.validate()?;
        self.worker.validate()?;
        self.pipeline.validate()?;
        self.event_bus.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}
