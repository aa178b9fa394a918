use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-user profile. Besides the fields maintained after each turn it keeps
/// whatever else has been merged in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_emotion_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_emotion: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// One sentiment sample of a user message, in [-1, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionRecord {
    pub score: f64,
    pub emotion: String,
    #[serde(default)]
    pub session_id: String,
    pub timestamp: String,
}

/// Long-term memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub content: String,
    pub time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MemoryEntry {
    pub fn new(content: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            content: content.into(),
            time: super::local_timestamp(),
            session_id,
        }
    }
}

/// Result of a mood analysis over a message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoodAnalysis {
    pub mood_intensity: f64,
    pub mood_category: String,
    pub thinking: String,
    pub scene: String,
}

impl Default for MoodAnalysis {
    fn default() -> Self {
        Self {
            mood_intensity: 0.0,
            mood_category: "neutral".to_string(),
            thinking: "Balanced".to_string(),
            scene: "General".to_string(),
        }
    }
}

/// Stored mood analysis in `messages/{sid}_mood.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodRecord {
    pub id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub analysis: MoodAnalysis,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}
