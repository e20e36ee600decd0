use std::collections::HashMap;

use tracing::{debug, trace};

use vigil_core::PipelineConfig;
use vigil_domain::models::{Detection, Track, TrackState};

/// 单次批次结束后的轨迹变化摘要
#[derive(Debug, Default)]
pub struct BatchSummary {
    /// 本批次内新建的轨迹
    pub created: Vec<u64>,
    /// 本批次内转为lost的轨迹
    pub newly_lost: Vec<u64>,
    /// 保留期满被驱逐的轨迹
    pub evicted: Vec<u64>,
}

/// 基于IoU的贪心多目标跟踪器，每个视频流持有独立实例
///
/// 检测与现有轨迹按类别和空间重叠做贪心匹配：IoU最高的
/// (检测, 轨迹) 对优先结对，IoU低于阈值的不匹配。未匹配的
/// 检测开启新轨迹；连续未匹配达到阈值的轨迹转为lost，再
/// 保留若干批次供事件闭合后驱逐。轨迹ID单调递增，永不复用。
pub struct IouTracker {
    stream_id: String,
    iou_threshold: f64,
    max_misses: u32,
    lost_retention: u32,
    next_id: u64,
    tracks: HashMap<u64, Track>,
}

impl IouTracker {
    pub fn new(stream_id: &str, config: &PipelineConfig) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            iou_threshold: config.iou_threshold,
            max_misses: config.max_track_misses,
            lost_retention: config.lost_track_retention,
            next_id: 1,
            tracks: HashMap::new(),
        }
    }

    /// 用一帧的检测结果更新轨迹集合
    ///
    /// 只有active轨迹参与匹配；每个检测匹配零或一条轨迹，
    /// 每条轨迹至多匹配一个检测。
    pub fn update(&mut self, detections: Vec<Detection>) {
        // 候选对按IoU降序贪心结对
        let mut pairs: Vec<(f64, u64, usize)> = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            for track in self.tracks.values() {
                if track.state != TrackState::Active || track.class_label != det.class_label {
                    continue;
                }
                if let Some(bbox) = track.latest_bbox() {
                    let iou = bbox.iou(&det.bbox);
                    if iou >= self.iou_threshold {
                        pairs.push((iou, track.id, idx));
                    }
                }
            }
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut matched_tracks: Vec<u64> = Vec::new();
        let mut matched_dets: Vec<usize> = Vec::new();
        let mut assignments: Vec<(u64, usize)> = Vec::new();
        for (_, track_id, det_idx) in pairs {
            if matched_tracks.contains(&track_id) || matched_dets.contains(&det_idx) {
                continue;
            }
            matched_tracks.push(track_id);
            matched_dets.push(det_idx);
            assignments.push((track_id, det_idx));
        }

        let mut detections: Vec<Option<Detection>> = detections.into_iter().map(Some).collect();
        for (track_id, det_idx) in assignments {
            if let (Some(track), Some(det)) =
                (self.tracks.get_mut(&track_id), detections[det_idx].take())
            {
                track.push(det);
            }
        }

        // 未匹配的active轨迹累计丢失
        for track in self.tracks.values_mut() {
            if track.state == TrackState::Active && !matched_tracks.contains(&track.id) {
                track.misses += 1;
            }
        }

        // 未匹配的检测开启新轨迹
        for det in detections.into_iter().flatten() {
            let id = self.next_id;
            self.next_id += 1;
            trace!(
                stream_id = %self.stream_id,
                track_id = id,
                class = %det.class_label,
                "新建轨迹"
            );
            self.tracks.insert(id, Track::new(id, &self.stream_id, det));
        }
    }

    /// 批次边界结算：active→lost转换、lost轨迹老化与驱逐
    pub fn end_batch(&mut self) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for track in self.tracks.values_mut() {
            match track.state {
                TrackState::Active if track.misses >= self.max_misses => {
                    track.state = TrackState::Lost;
                    track.lost_batches = 0;
                    summary.newly_lost.push(track.id);
                }
                TrackState::Lost => {
                    track.lost_batches += 1;
                }
                _ => {}
            }
        }

        let retention = self.lost_retention;
        let before = self.tracks.len();
        self.tracks.retain(|id, track| {
            let keep = track.state != TrackState::Lost || track.lost_batches <= retention;
            if !keep {
                summary.evicted.push(*id);
            }
            keep
        });
        if before != self.tracks.len() {
            debug!(
                stream_id = %self.stream_id,
                evicted = before - self.tracks.len(),
                remaining = self.tracks.len(),
                "lost轨迹保留期满，已驱逐"
            );
        }
        summary
    }

    pub fn active_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks
            .values()
            .filter(|t| t.state == TrackState::Active)
    }

    pub fn get(&self, track_id: u64) -> Option<&Track> {
        self.tracks.get(&track_id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
