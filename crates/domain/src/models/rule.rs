use serde::{Deserialize, Serialize};

use super::detection::BoundingBox;

/// 检测规则，外部配置方拥有并版本化，核心只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// 触发时产出的事件代码
    pub event_code: String,
    /// 目标类别，空表示匹配所有类别
    pub target_classes: Vec<String>,
    /// 全局置信度阈值
    pub confidence_threshold: f64,
    /// 所有条件同时满足时规则触发
    pub conditions: Vec<RuleCondition>,
    pub active: bool,
}

/// 规则条件，按种类标记的变体（显式分派，不做运行时反射）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// 轨迹最新检测的置信度超过阈值
    ConfidenceAbove { threshold: f64 },
    /// 轨迹中心点落在指定区域内
    InZone { zone: Zone },
    /// 轨迹持续存在至少指定时长（秒）
    MinDuration { seconds: f64 },
    /// 轨迹累计至少指定数量的检测
    MinDetections { count: usize },
}

/// 归一化的矩形检测区域
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub bounds: BoundingBox,
}

impl Zone {
    /// 点是否落在区域内
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.bounds.x
            && x <= self.bounds.x + self.bounds.w
            && y >= self.bounds.y
            && y <= self.bounds.y + self.bounds.h
    }
}

impl Rule {
    /// 规则是否适用于指定类别
    pub fn matches_class(&self, class_label: &str) -> bool {
        self.target_classes.is_empty()
            || self.target_classes.iter().any(|c| c == class_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_condition_tagged_serde() {
        let json = r#"{"kind": "min_duration", "seconds": 3.5}"#;
        let cond: RuleCondition = serde_json::from_str(json).unwrap();
        match cond {
            RuleCondition::MinDuration { seconds } => assert!((seconds - 3.5).abs() < 1e-9),
            other => panic!("unexpected condition: {other:?}"),
        }
    }

    #[test]
    fn test_zone_contains() {
        let zone = Zone {
            name: "loading-dock".to_string(),
            bounds: BoundingBox::new(0.2, 0.2, 0.4, 0.4),
        };
        assert!(zone.contains(0.3, 0.3));
        assert!(!zone.contains(0.1, 0.3));
        assert!(!zone.contains(0.3, 0.7));
    }

    #[test]
    fn test_empty_target_classes_match_all() {
        let rule = Rule {
            id: "r1".to_string(),
            name: "any".to_string(),
            event_code: "behavior_anomaly".to_string(),
            target_classes: vec![],
            confidence_threshold: 0.5,
            conditions: vec![],
            active: true,
        };
        assert!(rule.matches_class("person"));
        assert!(rule.matches_class("forklift"));
    }
}
