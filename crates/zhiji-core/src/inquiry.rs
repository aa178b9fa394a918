//! Guided inquiry: estimate how much of the client's situation is known and
//! suggest follow-up questions.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::json::extract_json;
use crate::llm::{chat_with_timeout, LlmMessage, TextGenerator};
use crate::model::{format_transcript, percent_from_value, tail, ChatMessage};
use crate::storage::JsonStore;

/// Completeness at which the picture is considered sufficient.
pub const SUFFICIENT_COMPLETENESS: u8 = 80;
/// History length after which pattern analysis runs regardless of completeness.
pub const PATTERN_HISTORY_THRESHOLD: usize = 4;
/// Inquiry only runs in the early part of a session.
pub const INQUIRY_HISTORY_LIMIT: usize = 10;

const MAX_QUESTIONS: usize = 2;
const CONTEXT_MESSAGES: usize = 10;

const SYSTEM_PROMPT: &str = "你是一个专业的心理咨询师助手，负责评估对话中的信息完整性。\n\
基于当前会话历史和最新消息，评估信息的完整程度，并确定是否需要进行引导性询问。\n\
返回JSON：need_inquiry (boolean), current_stage (string), information_completeness (0-100), \
missing_info (list), suggested_questions (最多2个), reason (string)。";

static COMPLETENESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"信息完整[度性]?[：:]\s*(\d+)%?").unwrap());
static STAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"当前阶段[：:]\s*([^\n]+)").unwrap());
static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[12]\.?\s*([^？?]*[？?])").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InquiryResult {
    #[serde(default = "default_true")]
    pub need_inquiry: bool,
    #[serde(default = "default_stage")]
    pub current_stage: String,
    #[serde(default = "default_completeness", deserialize_with = "lenient_completeness")]
    pub information_completeness: u8,
    #[serde(default)]
    pub missing_info: Vec<String>,
    #[serde(default)]
    pub suggested_questions: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

fn default_true() -> bool {
    true
}
fn default_stage() -> String {
    "基础情况了解".to_string()
}
fn default_completeness() -> u8 {
    50
}

fn lenient_completeness<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(percent_from_value(&value).unwrap_or(50))
}

impl InquiryResult {
    /// Used when the assessment itself fails.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            need_inquiry: false,
            current_stage: "评估失败".to_string(),
            information_completeness: 50,
            missing_info: Vec::new(),
            suggested_questions: Vec::new(),
            reason: reason.into(),
        }
    }

    /// Best-effort reading of a free-text assessment.
    pub fn parse_manually(text: &str) -> Self {
        let mut result = Self {
            need_inquiry: true,
            current_stage: default_stage(),
            information_completeness: default_completeness(),
            missing_info: Vec::new(),
            suggested_questions: Vec::new(),
            reason: "手动解析结果".to_string(),
        };
        if let Some(n) = COMPLETENESS_RE
            .captures(text)
            .and_then(|c| c[1].parse::<u32>().ok())
        {
            result.information_completeness = n.min(100) as u8;
        }
        if let Some(c) = STAGE_RE.captures(text) {
            result.current_stage = c[1].trim().to_string();
        }
        result.suggested_questions = QUESTION_RE
            .captures_iter(text)
            .take(MAX_QUESTIONS)
            .map(|c| c[1].trim().to_string())
            .collect();
        if result.information_completeness >= SUFFICIENT_COMPLETENESS {
            result.need_inquiry = false;
            result.current_stage = "信息充分".to_string();
        }
        result
    }
}

/// Whether behavioral pattern analysis should run this turn.
pub fn needs_pattern_analysis(
    pattern_enabled: bool,
    completeness: Option<u8>,
    history_len: usize,
    already_analyzed: bool,
) -> bool {
    pattern_enabled
        && !already_analyzed
        && (completeness.is_some_and(|c| c >= SUFFICIENT_COMPLETENESS)
            || history_len >= PATTERN_HISTORY_THRESHOLD)
}

pub struct InquiryService {
    llm: Option<Arc<dyn TextGenerator>>,
    store: Arc<JsonStore>,
    timeout_secs: u64,
}

impl InquiryService {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, store: Arc<JsonStore>, timeout_secs: u64) -> Self {
        Self {
            llm,
            store,
            timeout_secs,
        }
    }

    /// Assess information completeness. Never fails; see [`InquiryResult::failed`].
    pub async fn assess(&self, user_input: &str, history: &[ChatMessage]) -> InquiryResult {
        let Some(llm) = &self.llm else {
            return InquiryResult::failed("未配置语言模型");
        };
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(format!(
                "对话历史:\n{}\n\n当前消息: {user_input}\n\n请评估信息完整性并返回JSON格式的结果。",
                format_transcript(tail(history, CONTEXT_MESSAGES))
            )),
        ];
        match chat_with_timeout(llm.as_ref(), &messages, self.timeout_secs, "guided inquiry").await {
            Ok(reply) => {
                let mut result = extract_json(&reply)
                    .and_then(|v| serde_json::from_value::<InquiryResult>(v).ok())
                    .unwrap_or_else(|| {
                        tracing::debug!("inquiry reply was not JSON, parsing manually");
                        InquiryResult::parse_manually(&reply)
                    });
                result.suggested_questions.truncate(MAX_QUESTIONS);
                result
            }
            Err(e) => {
                tracing::warn!("guided inquiry failed: {e}");
                InquiryResult::failed(format!("评估出错: {e}"))
            }
        }
    }

    /// Persist the result as the session's latest inquiry and in its history.
    pub async fn record(&self, session_id: &str, result: &InquiryResult) {
        if let Err(e) = self.store.save_inquiry(session_id, result).await {
            tracing::warn!(session_id, "failed to save inquiry result: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGenerator;

    fn service(llm: ScriptedGenerator) -> (InquiryService, Arc<JsonStore>) {
        let dir = std::env::temp_dir().join(format!("zhiji-inq-{}", uuid::Uuid::now_v7()));
        let store = Arc::new(JsonStore::new(dir, 5));
        (InquiryService::new(Some(Arc::new(llm)), store.clone(), 5), store)
    }

    #[test]
    fn test_manual_parse() {
        let text = "当前阶段：问题探索\n信息完整度：65%\n建议问题：\n1. 这种情况持续多久了？\n2. 有什么让你感觉好一些吗？";
        let result = InquiryResult::parse_manually(text);
        assert!(result.need_inquiry);
        assert_eq!(result.current_stage, "问题探索");
        assert_eq!(result.information_completeness, 65);
        assert_eq!(
            result.suggested_questions,
            vec!["这种情况持续多久了？", "有什么让你感觉好一些吗？"]
        );
    }

    #[test]
    fn test_manual_parse_sufficient() {
        let result = InquiryResult::parse_manually("信息完整性: 85");
        assert!(!result.need_inquiry);
        assert_eq!(result.current_stage, "信息充分");
    }

    #[test]
    fn test_manual_parse_defaults() {
        let result = InquiryResult::parse_manually("没有结构化内容");
        assert_eq!(result.information_completeness, 50);
        assert_eq!(result.current_stage, "基础情况了解");
        assert!(result.suggested_questions.is_empty());
    }

    #[test]
    fn test_pattern_gate() {
        assert!(needs_pattern_analysis(true, Some(80), 0, false));
        assert!(needs_pattern_analysis(true, Some(30), 4, false));
        assert!(needs_pattern_analysis(true, None, 4, false));
        assert!(!needs_pattern_analysis(true, Some(79), 3, false));
        assert!(!needs_pattern_analysis(true, Some(90), 6, true));
        assert!(!needs_pattern_analysis(false, Some(90), 6, false));
    }

    #[tokio::test]
    async fn test_assess_json_reply() {
        let reply = r#"{"need_inquiry": true, "current_stage": "问题探索", "information_completeness": "40%", "missing_info": ["持续时间"], "suggested_questions": ["a？", "b？", "c？"], "reason": "信息不足"}"#;
        let (inquiry, _) = service(ScriptedGenerator::new(reply));
        let result = inquiry.assess("我睡不好", &[]).await;
        assert_eq!(result.information_completeness, 40);
        assert_eq!(result.suggested_questions.len(), 2);
    }

    #[tokio::test]
    async fn test_assess_failure() {
        let (inquiry, _) = service(ScriptedGenerator::failing("boom"));
        let result = inquiry.assess("我睡不好", &[]).await;
        assert_eq!(result.current_stage, "评估失败");
        assert_eq!(result.information_completeness, 50);
        assert!(!result.need_inquiry);
    }

    #[tokio::test]
    async fn test_record_appends_history() {
        let (inquiry, store) = service(ScriptedGenerator::new("{}"));
        let result = InquiryResult::parse_manually("信息完整度：30%");
        inquiry.record("s1", &result).await;
        inquiry.record("s1", &result).await;
        let history = store.get_inquiry_history("s1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["information_completeness"], 30);
        assert!(history[0].get("timestamp").is_some());
    }
}
