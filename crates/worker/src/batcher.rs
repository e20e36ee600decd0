use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use vigil_core::{PipelineConfig, VigilResult};
use vigil_domain::models::Frame;
use vigil_domain::ports::FrameStream;

/// 摄取侧的标称源帧率，采样步长据此换算
const SOURCE_FPS: u32 = 30;

/// 自适应帧采样器
///
/// 平时按基础帧率降采样；检测到事件后的冷却期内切换到突发
/// 帧率以捕获更多细节，冷却期结束自动回落。
pub struct FrameSampler {
    base_stride: u64,
    burst_stride: u64,
    burst_cooldown: ChronoDuration,
    burst_until: Option<DateTime<Utc>>,
}

impl FrameSampler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            base_stride: stride_for(config.base_sample_fps),
            burst_stride: stride_for(config.burst_sample_fps),
            burst_cooldown: ChronoDuration::seconds(config.burst_cooldown_seconds as i64),
            burst_until: None,
        }
    }

    /// 是否保留该帧
    pub fn should_sample(&mut self, frame: &Frame) -> bool {
        let stride = if self.in_burst(frame.timestamp) {
            self.burst_stride
        } else {
            self.burst_until = None;
            self.base_stride
        };
        frame.frame_number % stride == 0
    }

    /// 事件发生，进入突发采样冷却期
    pub fn note_event(&mut self, at: DateTime<Utc>) {
        let until = at + self.burst_cooldown;
        if self.burst_until.map_or(true, |cur| until > cur) {
            debug!(until = %until, "进入突发采样");
            self.burst_until = Some(until);
        }
    }

    pub fn in_burst(&self, at: DateTime<Utc>) -> bool {
        self.burst_until.is_some_and(|until| at < until)
    }
}

fn stride_for(fps: u32) -> u64 {
    (SOURCE_FPS / fps.max(1)).max(1) as u64
}

/// 帧批次组装器
///
/// 从帧流拉取并采样，凑满批次大小或等待超时后交付；等待
/// 超时交付部分批次以保证延迟上界。
pub struct FrameBatcher {
    batch_size: usize,
    max_wait: Duration,
}

impl FrameBatcher {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_wait: Duration::from_millis(config.batch_max_wait_ms),
        }
    }

    /// 组装下一批帧，返回 (批次, 是否到达流末尾)
    ///
    /// 等待超时而批次未满时交付已有部分（可能为空批次，调用方
    /// 跳过处理即可）。
    pub async fn next_batch(
        &self,
        stream: &mut dyn FrameStream,
        sampler: &mut FrameSampler,
    ) -> VigilResult<(Vec<Frame>, bool)> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let deadline = Instant::now() + self.max_wait;

        loop {
            if batch.len() >= self.batch_size {
                return Ok((batch, false));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok((batch, false));
            }
            match tokio::time::timeout(remaining, stream.next_frame()).await {
                // 等待超时，交付部分批次
                Err(_) => return Ok((batch, false)),
                Ok(Ok(None)) => return Ok((batch, true)),
                Ok(Ok(Some(frame))) => {
                    if sampler.should_sample(&frame) {
                        batch.push(frame);
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }
    }
}
