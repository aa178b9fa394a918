//! Intent routing: decide whether a turn needs the knowledge base, a web
//! search, or neither.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::json::extract_json;
use crate::llm::{generate_with_timeout, TextGenerator};
use crate::model::{format_transcript, tail, ChatMessage};

const CRISIS_KEYWORDS: &[&str] = &[
    "自杀", "想死", "活不下去", "结束生命", "不想活", "轻生", "结束一切", "解脱", "痛苦得想死",
];

const RAG_KEYWORDS: &[&str] = &[
    "抑郁症", "焦虑症", "治疗", "心理咨询", "心理医生", "药物", "认知行为疗法", "心理治疗", "症状",
    "诊断", "cbt", "ptsd", "强迫症", "恐慌症", "双相", "精神", "心理健康", "咨询师",
];

const WEB_KEYWORDS: &[&str] = &[
    "医院", "挂号", "预约", "地址", "电话", "最新", "新闻", "政策", "费用", "价格", "开放时间",
    "营业时间",
];

const CONTEXT_MESSAGES: usize = 4;

const SYSTEM_PROMPT: &str = r#"你是心理咨询对话系统的意图识别模块。分析用户消息，只返回一个JSON对象：
{"route_type": "direct_chat|rag_enhanced|web_search|crisis", "confidence": 0.0-1.0, "reason": "...",
 "rag_needed": bool, "web_search_needed": bool, "crisis_detected": bool, "search_keywords": [..] 或 null}
规则：自杀、自伤或极度绝望 → crisis；专业心理学概念、治疗方法、症状 → rag_enhanced；
最新信息、新闻、具体机构 → web_search；一般情感支持和日常交流 → direct_chat。"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteType {
    #[serde(rename = "direct_chat")]
    DirectChat,
    #[serde(rename = "rag_enhanced")]
    RagEnhanced,
    #[serde(rename = "web_search")]
    WebSearch,
    #[serde(rename = "crisis")]
    Crisis,
}

impl RouteType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "direct_chat" => Some(Self::DirectChat),
            "rag_enhanced" | "rag" => Some(Self::RagEnhanced),
            "web_search" => Some(Self::WebSearch),
            "crisis" => Some(Self::Crisis),
            _ => None,
        }
    }
}

/// Branch taken by the conversation graph after intent analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Rag,
    WebSearch,
    Direct,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rag => write!(f, "rag"),
            Self::WebSearch => write!(f, "web_search"),
            Self::Direct => write!(f, "direct_chat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResult {
    pub route_type: RouteType,
    pub confidence: f64,
    pub reason: String,
    pub rag_needed: bool,
    pub web_search_needed: bool,
    pub crisis_detected: bool,
    pub search_keywords: Option<Vec<String>>,
}

impl IntentResult {
    fn direct(confidence: f64, reason: impl Into<String>) -> Self {
        Self {
            route_type: RouteType::DirectChat,
            confidence,
            reason: reason.into(),
            rag_needed: false,
            web_search_needed: false,
            crisis_detected: false,
            search_keywords: None,
        }
    }

    /// A crisis classification here does not short-circuit the turn; that is
    /// the keyword detector's job. It only means no retrieval.
    pub fn route(&self) -> Route {
        match self.route_type {
            RouteType::RagEnhanced => Route::Rag,
            RouteType::WebSearch => Route::WebSearch,
            RouteType::DirectChat | RouteType::Crisis => Route::Direct,
        }
    }

    fn from_value(value: &serde_json::Value) -> Option<Self> {
        let route_type = RouteType::parse(value.get("route_type")?.as_str()?)?;
        let confidence = match value.get("confidence") {
            Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.5),
            Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.5),
            _ => 0.5,
        };
        let flag = |key: &str| value.get(key).and_then(|v| v.as_bool()).unwrap_or(false);
        let search_keywords = value.get("search_keywords").and_then(|v| v.as_array()).map(|a| {
            a.iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        });
        Some(Self {
            route_type,
            confidence: confidence.clamp(0.0, 1.0),
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            rag_needed: flag("rag_needed"),
            web_search_needed: flag("web_search_needed"),
            crisis_detected: flag("crisis_detected"),
            search_keywords,
        })
    }
}

/// Keyword classification used when no LLM is configured.
pub fn keyword_intent(message: &str) -> IntentResult {
    let lower = message.to_lowercase();
    if let Some(kw) = CRISIS_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return IntentResult {
            route_type: RouteType::Crisis,
            confidence: 0.9,
            reason: format!("检测到危机关键词: {kw}"),
            crisis_detected: true,
            ..IntentResult::direct(0.9, "")
        };
    }
    if let Some(kw) = RAG_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return IntentResult {
            route_type: RouteType::RagEnhanced,
            confidence: 0.8,
            reason: format!("检测到专业术语: {kw}"),
            rag_needed: true,
            search_keywords: Some(vec![kw.to_string()]),
            ..IntentResult::direct(0.8, "")
        };
    }
    if let Some(kw) = WEB_KEYWORDS.iter().find(|k| lower.contains(*k)) {
        return IntentResult {
            route_type: RouteType::WebSearch,
            confidence: 0.7,
            reason: format!("检测到搜索需求: {kw}"),
            web_search_needed: true,
            search_keywords: Some(vec![kw.to_string()]),
            ..IntentResult::direct(0.7, "")
        };
    }
    IntentResult::direct(0.6, "无特殊需求，进行常规对话")
}

pub struct IntentRouter {
    llm: Option<Arc<dyn TextGenerator>>,
    timeout_secs: u64,
}

impl IntentRouter {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, timeout_secs: u64) -> Self {
        Self { llm, timeout_secs }
    }

    /// Classify `message` given the recent conversation. Never fails: an
    /// unparseable reply routes to direct chat at 0.5, a failed call at 0.3.
    pub async fn analyze(&self, message: &str, history: &[ChatMessage]) -> IntentResult {
        let Some(llm) = &self.llm else {
            return keyword_intent(message);
        };

        let prompt = format!(
            "对话上下文：\n{}\n\n当前用户消息：\n{message}\n\n请返回JSON格式的分析结果。",
            format_transcript(tail(history, CONTEXT_MESSAGES))
        );
        match generate_with_timeout(llm.as_ref(), &prompt, Some(SYSTEM_PROMPT), self.timeout_secs, "intent analysis").await {
            Ok(reply) => match extract_json(&reply).as_ref().and_then(IntentResult::from_value) {
                Some(result) => {
                    tracing::debug!(route = ?result.route_type, confidence = result.confidence, "intent classified");
                    result
                }
                None => {
                    tracing::warn!("intent reply was not valid JSON, defaulting to direct chat");
                    IntentResult::direct(0.5, "JSON解析失败，使用默认路由")
                }
            },
            Err(e) => {
                tracing::warn!("intent analysis failed: {e}");
                IntentResult::direct(0.3, format!("意图识别异常: {e}"))
            }
        }
    }
}
