use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-session dialogue plan. Unknown fields produced by the LLM are kept
/// in `extra` so a save never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub user_intent: UserIntent,
    #[serde(default)]
    pub current_state: CurrentState,
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
    #[serde(default)]
    pub context: PlanContext,
    #[serde(default)]
    pub inquiry_status: InquiryStatus,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIntent {
    #[serde(rename = "type", default = "unknown")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub identified_at: String,
}

impl Default for UserIntent {
    fn default() -> Self {
        Self {
            kind: unknown(),
            description: String::new(),
            confidence: 0.0,
            identified_at: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    #[serde(default = "intent_identification")]
    pub stage: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub last_updated: String,
}

impl Default for CurrentState {
    fn default() -> Self {
        Self {
            stage: intent_identification(),
            progress: 0.0,
            last_updated: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanContext {
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InquiryStatus {
    #[serde(default = "initial_stage")]
    pub stage: String,
    /// 0-100.
    #[serde(default, deserialize_with = "lenient_percent")]
    pub information_completeness: u8,
    #[serde(default)]
    pub collected_info: BTreeMap<String, serde_json::Value>,
    /// Once true, stays true for the life of the session.
    #[serde(default)]
    pub pattern_analyzed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_analysis_completed_at: Option<String>,
}

impl Default for InquiryStatus {
    fn default() -> Self {
        Self {
            stage: initial_stage(),
            information_completeness: 0,
            collected_info: BTreeMap::new(),
            pattern_analyzed: false,
            pattern_analysis_completed_at: None,
        }
    }
}

/// Read a 0-100 percentage from a JSON number or a string such as `"85%"`.
pub fn percent_from_value(value: &serde_json::Value) -> Option<u8> {
    let raw = match value {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok()?,
        _ => return None,
    };
    Some(raw.clamp(0.0, 100.0).round() as u8)
}

fn lenient_percent<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(percent_from_value(&value).unwrap_or(0))
}

fn unknown() -> String {
    "unknown".to_string()
}
fn intent_identification() -> String {
    "intent_identification".to_string()
}
fn initial_stage() -> String {
    "初始阶段".to_string()
}

impl Plan {
    /// Fresh plan for a session that has none yet.
    pub fn new_default() -> Self {
        let now = super::iso_now();
        Self {
            user_intent: UserIntent {
                identified_at: now.clone(),
                ..Default::default()
            },
            current_state: CurrentState {
                last_updated: now,
                ..Default::default()
            },
            steps: Vec::new(),
            context: PlanContext::default(),
            inquiry_status: InquiryStatus::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Minimal plan used when plan maintenance fails entirely.
    pub fn basic() -> Self {
        let mut plan = Self::new_default();
        plan.current_state.stage = "基础对话".to_string();
        plan
    }

    /// Merge an LLM-proposed plan over the previous one.
    ///
    /// `inquiry_status` is carried over when the proposal omits it, and
    /// `pattern_analyzed` can only move from false to true.
    pub fn merge_proposal(&self, proposal: &serde_json::Value) -> Option<Plan> {
        let mut next: Plan = serde_json::from_value(proposal.clone()).ok()?;
        if proposal.get("inquiry_status").is_none() {
            next.inquiry_status = self.inquiry_status.clone();
        }
        if self.inquiry_status.pattern_analyzed {
            next.inquiry_status.pattern_analyzed = true;
            if next.inquiry_status.pattern_analysis_completed_at.is_none() {
                next.inquiry_status.pattern_analysis_completed_at =
                    self.inquiry_status.pattern_analysis_completed_at.clone();
            }
        }
        next.current_state.last_updated = super::iso_now();
        Some(next)
    }

    pub fn touch(&mut self) {
        self.current_state.last_updated = super::iso_now();
    }
}
