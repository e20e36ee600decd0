use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use vigil_core::{VigilError, VigilResult};
use vigil_domain::models::{BoundingBox, Detection, Frame};
use vigil_domain::ports::{Detector, FrameSource, FrameStream};

/// 合成帧源，用于演示与测试
///
/// 按固定节奏产出指定数量的空白帧，无需真实视频解码。
pub struct SyntheticFrameSource {
    pub frame_count: u64,
    pub frame_interval_ms: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticFrameSource {
    fn default() -> Self {
        Self {
            frame_count: 120,
            frame_interval_ms: 0,
            width: 640,
            height: 360,
        }
    }
}

struct SyntheticFrameStream {
    next_frame: u64,
    frame_count: u64,
    frame_interval_ms: u64,
    width: u32,
    height: u32,
}

#[async_trait]
impl FrameStream for SyntheticFrameStream {
    async fn next_frame(&mut self) -> VigilResult<Option<Frame>> {
        if self.next_frame >= self.frame_count {
            return Ok(None);
        }

        if self.frame_interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.frame_interval_ms)).await;
        } else {
            // I/O边界：即使不模拟节奏也让出调度权
            tokio::task::yield_now().await;
        }

        let frame = Frame {
            frame_number: self.next_frame,
            timestamp: Utc::now(),
            width: self.width,
            height: self.height,
            data: Vec::new(),
        };
        self.next_frame += 1;
        Ok(Some(frame))
    }
}

#[async_trait]
impl FrameSource for SyntheticFrameSource {
    async fn open(&self, segment_ref: &str) -> VigilResult<Box<dyn FrameStream>> {
        if segment_ref.is_empty() {
            return Err(VigilError::FrameSource("空的片段引用".to_string()));
        }
        Ok(Box::new(SyntheticFrameStream {
            next_frame: 0,
            frame_count: self.frame_count,
            frame_interval_ms: self.frame_interval_ms,
            width: self.width,
            height: self.height,
        }))
    }
}

/// 合成检测后端，用于演示与测试
///
/// 对每帧确定性地产出一个沿对角线移动的目标检测，可配置注入
/// 失败（每N次调用失败一次）来验证管线的失败语义。
pub struct SyntheticDetector {
    pub class_label: String,
    pub confidence: f64,
    pub latency_ms: u64,
    /// 每N次调用失败一次，0表示从不失败
    pub fail_every: u64,
    calls: AtomicU64,
}

impl SyntheticDetector {
    pub fn new(class_label: &str, confidence: f64) -> Self {
        Self {
            class_label: class_label.to_string(),
            confidence,
            latency_ms: 0,
            fail_every: 0,
            calls: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_failure_injection(mut self, fail_every: u64) -> Self {
        self.fail_every = fail_every;
        self
    }
}

#[async_trait]
impl Detector for SyntheticDetector {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn detect(&self, batch: &[Frame]) -> VigilResult<Vec<Vec<Detection>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(VigilError::InferenceError(format!(
                "注入的推理失败（第{call}次调用）"
            )));
        }

        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }

        let results = batch
            .iter()
            .map(|frame| {
                // 目标沿对角线缓慢移动，保证相邻帧的IoU足够匹配
                let offset = (frame.frame_number as f64 * 0.005) % 0.7;
                vec![Detection {
                    timestamp: frame.timestamp,
                    frame_number: frame.frame_number,
                    class_label: self.class_label.clone(),
                    confidence: self.confidence,
                    bbox: BoundingBox::new(0.1 + offset, 0.1 + offset, 0.2, 0.2),
                }]
            })
            .collect();

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_source_produces_expected_count() {
        let source = SyntheticFrameSource {
            frame_count: 5,
            ..SyntheticFrameSource::default()
        };
        let mut stream = source.open("segments/test/0001.ts").await.unwrap();

        let mut count = 0;
        while let Some(frame) = stream.next_frame().await.unwrap() {
            assert_eq!(frame.frame_number, count);
            count += 1;
        }
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_empty_segment_ref_rejected() {
        let source = SyntheticFrameSource::default();
        assert!(source.open("").await.is_err());
    }

    #[tokio::test]
    async fn test_detector_consecutive_frames_overlap() {
        let detector = SyntheticDetector::new("person", 0.9);
        let frames: Vec<Frame> = (0..2)
            .map(|n| Frame {
                frame_number: n,
                timestamp: Utc::now(),
                width: 640,
                height: 360,
                data: Vec::new(),
            })
            .collect();

        let results = detector.detect(&frames).await.unwrap();
        assert_eq!(results.len(), 2);
        let iou = results[0][0].bbox.iou(&results[1][0].bbox);
        assert!(iou > 0.5, "相邻帧的检测框应该有足够重叠: {iou}");
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let detector = SyntheticDetector::new("person", 0.9).with_failure_injection(2);
        let frame = Frame {
            frame_number: 0,
            timestamp: Utc::now(),
            width: 640,
            height: 360,
            data: Vec::new(),
        };

        assert!(detector.detect(std::slice::from_ref(&frame)).await.is_ok());
        assert!(detector.detect(std::slice::from_ref(&frame)).await.is_err());
        assert!(detector.detect(std::slice::from_ref(&frame)).await.is_ok());
    }
}
