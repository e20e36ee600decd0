use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use vigil_domain::models::{CandidateEvent, Rule, RuleCondition, Track};

/// 某条规则对某条轨迹的触发状态
struct ArmState {
    /// 条件开始连续满足的时刻
    since: DateTime<Utc>,
    /// 本次连续满足区间内是否已触发过
    fired: bool,
}

/// 声明式规则引擎
///
/// 规则由外部配置方拥有，通过watch通道热更新，批次边界生效，
/// 不中断在途处理。同一规则对同一轨迹在一个连续满足区间内只
/// 触发一次；条件一旦不满足即重新武装，再次满足可再次触发。
pub struct RuleEngine {
    rules_rx: watch::Receiver<Arc<Vec<Rule>>>,
    rules: Arc<Vec<Rule>>,
    arm: HashMap<(String, u64), ArmState>,
}

impl RuleEngine {
    pub fn new(rules_rx: watch::Receiver<Arc<Vec<Rule>>>) -> Self {
        let rules = rules_rx.borrow().clone();
        Self {
            rules_rx,
            rules,
            arm: HashMap::new(),
        }
    }

    /// 拉取最新规则集（批次边界调用）；发送端已关闭时沿用现有规则
    pub fn refresh(&mut self) {
        if self.rules_rx.has_changed().unwrap_or(false) {
            self.rules = self.rules_rx.borrow_and_update().clone();
            info!(rules = self.rules.len(), "规则集已热更新");
        }
    }

    /// 对一组active轨迹评估全部启用规则，返回本批次触发的候选事件
    pub fn evaluate(&mut self, tracks: &[&Track]) -> Vec<CandidateEvent> {
        let rules = self.rules.clone();
        let mut events = Vec::new();

        for rule in rules.iter().filter(|r| r.active) {
            for track in tracks {
                if !rule.matches_class(&track.class_label) {
                    continue;
                }
                let key = (rule.id.clone(), track.id);
                if !Self::satisfied(rule, track) {
                    // 条件中断，重新武装
                    self.arm.remove(&key);
                    continue;
                }

                let state = self.arm.entry(key).or_insert_with(|| ArmState {
                    since: track.last_seen,
                    fired: false,
                });
                if state.fired {
                    continue;
                }
                state.fired = true;

                let confidence = track
                    .detections
                    .last()
                    .map(|d| d.confidence)
                    .unwrap_or(0.0);
                debug!(
                    rule_id = %rule.id,
                    track_id = track.id,
                    stream_id = %track.stream_id,
                    event_code = %rule.event_code,
                    confidence,
                    "规则触发"
                );
                events.push(CandidateEvent::new(
                    &rule.event_code,
                    &track.stream_id,
                    vec![track.id],
                    confidence,
                    state.since,
                    track.last_seen,
                    &rule.id,
                ));
            }
        }
        events
    }

    /// 轨迹驱逐后清理其触发状态
    pub fn forget_track(&mut self, track_id: u64) {
        self.arm.retain(|(_, tid), _| *tid != track_id);
    }

    /// 全局阈值与所有条件同时满足时规则对该轨迹成立
    fn satisfied(rule: &Rule, track: &Track) -> bool {
        let Some(latest) = track.detections.last() else {
            return false;
        };
        if latest.confidence < rule.confidence_threshold {
            return false;
        }
        rule.conditions.iter().all(|cond| match cond {
            RuleCondition::ConfidenceAbove { threshold } => latest.confidence > *threshold,
            RuleCondition::InZone { zone } => {
                let (cx, cy) = latest.bbox.center();
                zone.contains(cx, cy)
            }
            RuleCondition::MinDuration { seconds } => {
                track.duration().num_milliseconds() as f64 / 1000.0 >= *seconds
            }
            RuleCondition::MinDetections { count } => track.detection_count() >= *count,
        })
    }
}
