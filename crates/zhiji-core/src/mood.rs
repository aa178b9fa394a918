//! Mood analysis over a list of user messages.

use std::sync::Arc;

use crate::json::extract_json;
use crate::llm::{generate_with_timeout, TextGenerator};
use crate::model::MoodAnalysis;

const PROMPT: &str = r#"You are a mood analysis expert. Analyze the mood of the given messages and answer in Chinese with:
1. A mood intensity score (0 to 10).
2. A mood category (e.g. 开心, 悲伤, 生气, 中性).
3. The thinking (e.g. 我真是一事无成).
4. The scene related to the mood (e.g. 在朋友圈看到朋友的分享).
Respond only with JSON: {"moodIntensity": <number>, "moodCategory": "...", "thinking": "...", "scene": "..."}"#;

fn analysis_from_value(value: &serde_json::Value) -> Option<MoodAnalysis> {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let intensity = match value.get("moodIntensity")? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let defaults = MoodAnalysis::default();
    Some(MoodAnalysis {
        mood_intensity: intensity.clamp(0.0, 10.0),
        mood_category: text("moodCategory").unwrap_or(defaults.mood_category),
        thinking: text("thinking").unwrap_or(defaults.thinking),
        scene: text("scene").unwrap_or(defaults.scene),
    })
}

pub struct MoodAnalyzer {
    llm: Option<Arc<dyn TextGenerator>>,
    timeout_secs: u64,
}

impl MoodAnalyzer {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, timeout_secs: u64) -> Self {
        Self { llm, timeout_secs }
    }

    /// Analyze `messages`. Any failure yields the neutral default.
    pub async fn analyze(&self, messages: &[String]) -> MoodAnalysis {
        let Some(llm) = &self.llm else {
            return MoodAnalysis::default();
        };
        let listed = messages
            .iter()
            .map(|m| format!("- {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!("{PROMPT}\n\nMessages:\n{listed}");
        match generate_with_timeout(llm.as_ref(), &prompt, None, self.timeout_secs, "mood analysis").await {
            Ok(reply) => extract_json(&reply)
                .as_ref()
                .and_then(analysis_from_value)
                .unwrap_or_else(|| {
                    tracing::warn!("mood reply was not usable JSON");
                    MoodAnalysis::default()
                }),
            Err(e) => {
                tracing::warn!("mood analysis failed: {e}");
                MoodAnalysis::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;

    fn analyzer(llm: ScriptedGenerator) -> MoodAnalyzer {
        MoodAnalyzer::new(Some(Arc::new(llm)), 5)
    }

    #[tokio::test]
    async fn test_parses_reply() {
        let reply = r#"{"moodIntensity": 7, "moodCategory": "悲伤", "thinking": "我真是一事无成", "scene": "加班后"}"#;
        let mood = analyzer(ScriptedGenerator::new(reply))
            .analyze(&["今天又被批评了".to_string()])
            .await;
        assert_eq!(mood.mood_intensity, 7.0);
        assert_eq!(mood.mood_category, "悲伤");
        assert_eq!(mood.scene, "加班后");
    }

    #[tokio::test]
    async fn test_intensity_is_clamped() {
        let mood = analyzer(ScriptedGenerator::new(r#"{"moodIntensity": "42", "moodCategory": "生气"}"#))
            .analyze(&["气死了".to_string()])
            .await;
        assert_eq!(mood.mood_intensity, 10.0);
        assert_eq!(mood.thinking, "Balanced");
    }

    #[tokio::test]
    async fn test_failures_are_neutral() {
        let neutral = MoodAnalysis::default();
        assert_eq!(analyzer(ScriptedGenerator::new("not json")).analyze(&[]).await, neutral);
        assert_eq!(analyzer(ScriptedGenerator::failing("timeout")).analyze(&[]).await, neutral);
        assert_eq!(MoodAnalyzer::new(None, 5).analyze(&[]).await, neutral);
    }
}
