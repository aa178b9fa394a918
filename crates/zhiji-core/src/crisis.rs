//! Keyword screening for self-harm and acute distress.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

pub const HIGH_RISK_KEYWORDS: &[&str] = &["自杀", "想死", "活不下去", "结束生命", "杀人", "伤害自己"];

pub const MEDIUM_RISK_KEYWORDS: &[&str] = &["受不了", "绝望", "崩溃", "痛苦", "没有希望"];

/// Psychological aid hotline quoted in every crisis reply.
pub const HOTLINE: &str = "400-161-9995";

const CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    None,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisVerdict {
    pub is_crisis: bool,
    pub reason: Option<String>,
    pub severity: Severity,
}

impl CrisisVerdict {
    fn clear() -> Self {
        Self {
            is_crisis: false,
            reason: None,
            severity: Severity::None,
        }
    }

    /// Fixed safety reply for this verdict. `None` when there is no crisis.
    pub fn safety_message(&self) -> Option<String> {
        let reason = self.reason.as_deref().unwrap_or_default();
        match self.severity {
            Severity::High => Some(format!(
                "⚠️ 检测到高危情绪危机: {reason}\n\n请立即联系专业人士或拨打心理援助热线 {HOTLINE}。\n您的生命很宝贵，请寻求帮助。我们关心您。"
            )),
            Severity::Medium => Some(format!(
                "⚠️ 检测到您当前情绪压力较大: {reason}\n\n如果感到难以承受，请及时联系专业人士或拨打心理援助热线 {HOTLINE}。\n您并不孤单，我们愿意陪您一起面对。"
            )),
            Severity::None => None,
        }
    }

    /// Long-term memory line recorded for a crisis turn.
    pub fn memory_line(&self, text: &str) -> Option<String> {
        let tag = match self.severity {
            Severity::High => "CRISIS-HIGH",
            Severity::Medium => "CRISIS-MEDIUM",
            Severity::None => return None,
        };
        Some(format!(
            "[{tag}] {text} – {}",
            self.reason.as_deref().unwrap_or_default()
        ))
    }
}

/// Substring matcher with a per-text verdict cache.
#[derive(Debug, Default)]
pub struct CrisisDetector {
    cache: RwLock<HashMap<String, CrisisVerdict>>,
}

impl CrisisDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// High-risk keywords are checked before medium-risk ones, each list in order.
    pub fn detect(&self, text: &str) -> CrisisVerdict {
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(text) {
                return hit.clone();
            }
        }

        let verdict = classify(text);

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
            cache.insert(text.to_string(), verdict.clone());
        }
        verdict
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

fn classify(text: &str) -> CrisisVerdict {
    if let Some(kw) = HIGH_RISK_KEYWORDS.iter().find(|kw| text.contains(*kw)) {
        return CrisisVerdict {
            is_crisis: true,
            reason: Some(format!("检测到高危词: '{kw}'")),
            severity: Severity::High,
        };
    }
    if let Some(kw) = MEDIUM_RISK_KEYWORDS.iter().find(|kw| text.contains(*kw)) {
        return CrisisVerdict {
            is_crisis: true,
            reason: Some(format!("检测到中危词: '{kw}'")),
            severity: Severity::Medium,
        };
    }
    CrisisVerdict::clear()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_risk_keyword() {
        let detector = CrisisDetector::new();
        let v = detector.detect("我真的想死了");
        assert!(v.is_crisis);
        assert_eq!(v.severity, Severity::High);
        assert_eq!(v.reason.as_deref(), Some("检测到高危词: '想死'"));
    }

    #[test]
    fn test_high_wins_over_medium() {
        let v = CrisisDetector::new().detect("太痛苦了，活不下去");
        assert_eq!(v.severity, Severity::High);
        assert!(v.reason.unwrap().contains("活不下去"));
    }

    #[test]
    fn test_medium_risk_keyword() {
        let v = CrisisDetector::new().detect("工作让我快崩溃了");
        assert!(v.is_crisis);
        assert_eq!(v.severity, Severity::Medium);
    }

    #[test]
    fn test_ordinary_text() {
        let v = CrisisDetector::new().detect("今天天气不错");
        assert!(!v.is_crisis);
        assert_eq!(v.severity, Severity::None);
        assert!(v.safety_message().is_none());
        assert!(v.memory_line("今天天气不错").is_none());
    }

    #[test]
    fn test_verdicts_are_cached() {
        let detector = CrisisDetector::new();
        let first = detector.detect("绝望");
        let second = detector.detect("绝望");
        assert_eq!(first, second);
        assert_eq!(detector.cached_len(), 1);
    }

    #[test]
    fn test_safety_message_has_hotline() {
        let detector = CrisisDetector::new();
        for text in ["我想自杀", "我受不了了"] {
            let msg = detector.detect(text).safety_message().unwrap();
            assert!(msg.contains(HOTLINE));
        }
    }

    #[test]
    fn test_memory_line_format() {
        let v = CrisisDetector::new().detect("我想伤害自己");
        assert_eq!(
            v.memory_line("我想伤害自己").unwrap(),
            "[CRISIS-HIGH] 我想伤害自己 – 检测到高危词: '伤害自己'"
        );
    }
}
