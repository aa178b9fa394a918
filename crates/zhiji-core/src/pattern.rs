//! Behavioral pattern analysis, run at most once per session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::inquiry::InquiryResult;
use crate::json::extract_json;
use crate::llm::{chat_with_timeout, LlmMessage, TextGenerator};
use crate::model::{format_transcript, tail, ChatMessage, PlanContext};

const CONTEXT_MESSAGES: usize = 10;

const SYSTEM_PROMPT: &str = r#"你是一个专业的心理学行为模式分析师。基于用户的对话历史和收集的信息，进行深度的行为模式分析。
只返回JSON：
{"pattern_analysis": {"trigger_patterns": {}, "cognitive_patterns": {}, "emotional_patterns": {},
  "behavioral_patterns": {}, "interpersonal_patterns": {}, "resource_patterns": {}},
 "pattern_summary": "...", "key_insights": ["..."], "consultation_recommendations": ["..."]}"#;

/// The six pattern families. Each is a free-form object from the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCategories {
    #[serde(default = "empty_object")]
    pub trigger_patterns: serde_json::Value,
    #[serde(default = "empty_object")]
    pub cognitive_patterns: serde_json::Value,
    #[serde(default = "empty_object")]
    pub emotional_patterns: serde_json::Value,
    #[serde(default = "empty_object")]
    pub behavioral_patterns: serde_json::Value,
    #[serde(default = "empty_object")]
    pub interpersonal_patterns: serde_json::Value,
    #[serde(default = "empty_object")]
    pub resource_patterns: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    json!({})
}

impl Default for PatternCategories {
    fn default() -> Self {
        Self {
            trigger_patterns: empty_object(),
            cognitive_patterns: empty_object(),
            emotional_patterns: empty_object(),
            behavioral_patterns: empty_object(),
            interpersonal_patterns: empty_object(),
            resource_patterns: empty_object(),
        }
    }
}

impl PatternCategories {
    /// Skeleton where every qualitative field reads `label`.
    fn skeleton(label: &str) -> Self {
        Self {
            trigger_patterns: json!({"common_triggers": [], "trigger_intensity": label, "trigger_frequency": label}),
            cognitive_patterns: json!({"thinking_styles": [], "cognitive_biases": [], "core_beliefs": []}),
            emotional_patterns: json!({"primary_emotions": [], "emotion_regulation": label, "emotion_duration": label}),
            behavioral_patterns: json!({"coping_strategies": [], "behavior_effectiveness": label, "behavior_habits": []}),
            interpersonal_patterns: json!({"interaction_style": label, "support_utilization": label, "social_behaviors": []}),
            resource_patterns: json!({"personal_strengths": [], "successful_experiences": [], "growth_potential": []}),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternAnalysis {
    #[serde(default)]
    pub pattern_analysis: PatternCategories,
    #[serde(default)]
    pub pattern_summary: String,
    #[serde(default)]
    pub key_insights: Vec<String>,
    #[serde(default)]
    pub consultation_recommendations: Vec<String>,
}

impl PatternAnalysis {
    /// Placeholder when the model answered without usable JSON.
    pub fn manual() -> Self {
        let mut categories = PatternCategories::skeleton("部分有效");
        categories.trigger_patterns = json!({"common_triggers": [], "trigger_intensity": "中", "trigger_frequency": "经常"});
        categories.emotional_patterns =
            json!({"primary_emotions": [], "emotion_regulation": "部分有效", "emotion_duration": "中等"});
        categories.interpersonal_patterns =
            json!({"interaction_style": "被动", "support_utilization": "部分", "social_behaviors": []});
        Self {
            pattern_analysis: categories,
            pattern_summary: "基于对话内容进行的手动模式分析".to_string(),
            key_insights: vec!["需要进一步分析".into(), "模式识别中".into(), "持续关注".into()],
            consultation_recommendations: vec![
                "保持开放沟通".into(),
                "建立信任关系".into(),
                "逐步深入了解".into(),
            ],
        }
    }

    /// Placeholder when the analysis call failed.
    pub fn failed(reason: &str) -> Self {
        Self {
            pattern_analysis: PatternCategories::skeleton("未知"),
            pattern_summary: format!("模式分析失败: {reason}"),
            key_insights: vec!["需要更多信息进行分析".into()],
            consultation_recommendations: vec!["继续对话收集信息".into()],
        }
    }
}

pub struct PatternAnalyzer {
    llm: Option<Arc<dyn TextGenerator>>,
    timeout_secs: u64,
}

impl PatternAnalyzer {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, timeout_secs: u64) -> Self {
        Self { llm, timeout_secs }
    }

    /// Analyze the conversation so far, including the current input. Never
    /// fails; falls back to [`PatternAnalysis::manual`] or
    /// [`PatternAnalysis::failed`].
    pub async fn analyze(
        &self,
        session_id: &str,
        user_input: &str,
        history: &[ChatMessage],
        context: &PlanContext,
        inquiry: Option<&InquiryResult>,
    ) -> PatternAnalysis {
        let Some(llm) = &self.llm else {
            return PatternAnalysis::failed("未配置语言模型");
        };

        let mut conversation = tail(history, CONTEXT_MESSAGES).to_vec();
        conversation.push(ChatMessage::user(user_input));
        let collected = json!({
            "session_id": session_id,
            "plan_context": context,
            "inquiry_stage": inquiry.map(|i| i.current_stage.as_str()).unwrap_or("信息充分"),
            "inquiry_result": inquiry,
        });
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(format!(
                "对话历史:\n{}\n\n会话信息: {collected}\n\n请进行深度的行为模式分析并返回JSON格式的结果。",
                format_transcript(&conversation)
            )),
        ];

        match chat_with_timeout(llm.as_ref(), &messages, self.timeout_secs, "pattern analysis").await {
            Ok(reply) => extract_json(&reply)
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_else(|| {
                    tracing::warn!(session_id, "pattern reply was not valid JSON, using manual skeleton");
                    PatternAnalysis::manual()
                }),
            Err(e) => {
                tracing::warn!(session_id, "pattern analysis failed: {e}");
                PatternAnalysis::failed(&e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;

    fn analyzer(llm: ScriptedGenerator) -> PatternAnalyzer {
        PatternAnalyzer::new(Some(Arc::new(llm)), 5)
    }

    #[tokio::test]
    async fn test_parses_structured_reply() {
        let reply = r#"分析如下：{"pattern_analysis": {"trigger_patterns": {"common_triggers": ["工作截止日期"]}}, "pattern_summary": "压力下回避", "key_insights": ["回避"], "consultation_recommendations": ["时间管理"]}"#;
        let result = analyzer(ScriptedGenerator::new(reply))
            .analyze("s1", "我又拖延了", &[], &PlanContext::default(), None)
            .await;
        assert_eq!(result.pattern_summary, "压力下回避");
        assert_eq!(result.pattern_analysis.trigger_patterns["common_triggers"][0], "工作截止日期");
        assert_eq!(result.pattern_analysis.resource_patterns, json!({}));
    }

    #[tokio::test]
    async fn test_malformed_reply_uses_manual() {
        let result = analyzer(ScriptedGenerator::new("用户表现出回避模式"))
            .analyze("s1", "我又拖延了", &[], &PlanContext::default(), None)
            .await;
        assert_eq!(result, PatternAnalysis::manual());
    }

    #[tokio::test]
    async fn test_failure_uses_error_skeleton() {
        let result = analyzer(ScriptedGenerator::failing("timeout"))
            .analyze("s1", "我又拖延了", &[], &PlanContext::default(), None)
            .await;
        assert!(result.pattern_summary.starts_with("模式分析失败"));
        assert_eq!(result.pattern_analysis.trigger_patterns["trigger_intensity"], "未知");
    }

    #[tokio::test]
    async fn test_prompt_includes_current_input() {
        let llm = Arc::new(ScriptedGenerator::new("{}"));
        let analyzer = PatternAnalyzer::new(Some(llm.clone()), 5);
        let history = vec![ChatMessage::user("第一句"), ChatMessage::agent("回应")];
        analyzer
            .analyze("s1", "最新的一句", &history, &PlanContext::default(), None)
            .await;
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("用户: 第一句"));
        assert!(prompt.contains("咨询师: 回应"));
        assert!(prompt.contains("用户: 最新的一句"));
    }
}
