use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 解码后的单帧图像，由帧源产出
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_number: u64,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// 原始像素数据（解码由摄取侧完成）
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// 归一化边界框 (x, y, w, h)，取值范围0.0-1.0
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    pub fn area(&self) -> f64 {
        self.w * self.h
    }

    /// 中心点坐标
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// 交并比，用于检测与轨迹的空间匹配
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.w).min(other.x + other.w);
        let y2 = (self.y + self.h).min(other.y + other.h);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union == 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// 单帧上的一个检测结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub timestamp: DateTime<Utc>,
    pub frame_number: u64,
    pub class_label: String,
    /// 置信度，0.0-1.0
    pub confidence: f64,
    pub bbox: BoundingBox,
}

/// 轨迹状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrackState {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "LOST")]
    Lost,
}

/// 跨帧的稳定目标轨迹，属于单一视频流
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub stream_id: String,
    pub class_label: String,
    /// 时间序的检测序列（插入顺序即时间顺序）
    pub detections: Vec<Detection>,
    pub state: TrackState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// 连续未匹配的批次计数
    pub misses: u32,
    /// 转为lost后经历的批次数，用于延迟驱逐
    pub lost_batches: u32,
}

impl Track {
    pub fn new(id: u64, stream_id: &str, detection: Detection) -> Self {
        let ts = detection.timestamp;
        Self {
            id,
            stream_id: stream_id.to_string(),
            class_label: detection.class_label.clone(),
            detections: vec![detection],
            state: TrackState::Active,
            first_seen: ts,
            last_seen: ts,
            misses: 0,
            lost_batches: 0,
        }
    }

    /// 追加一个匹配的检测，重置丢失计数
    pub fn push(&mut self, detection: Detection) {
        self.last_seen = detection.timestamp;
        self.detections.push(detection);
        self.misses = 0;
    }

    pub fn latest_bbox(&self) -> Option<&BoundingBox> {
        self.detections.last().map(|d| &d.bbox)
    }

    pub fn detection_count(&self) -> usize {
        self.detections.len()
    }

    /// 轨迹持续时长
    pub fn duration(&self) -> chrono::Duration {
        self.last_seen - self.first_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f64, y: f64) -> Detection {
        Detection {
            timestamp: Utc::now(),
            frame_number: 0,
            class_label: "person".to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(x, y, 0.2, 0.2),
        }
    }

    #[test]
    fn test_iou_identical_boxes() {
        let b = BoundingBox::new(0.1, 0.1, 0.3, 0.3);
        assert!((b.iou(&b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 0.1, 0.1);
        let b = BoundingBox::new(0.5, 0.5, 0.1, 0.1);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BoundingBox::new(0.1, 0.1, 0.2, 0.2);
        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);
    }

    #[test]
    fn test_track_push_resets_misses() {
        let mut track = Track::new(1, "cam-01", det(0.1, 0.1));
        track.misses = 3;
        track.push(det(0.12, 0.11));
        assert_eq!(track.misses, 0);
        assert_eq!(track.detection_count(), 2);
    }
}
