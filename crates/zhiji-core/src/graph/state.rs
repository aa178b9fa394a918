use std::collections::BTreeMap;

use serde::Serialize;

use crate::crisis::CrisisVerdict;
use crate::inquiry::InquiryResult;
use crate::intent::{IntentResult, Route};
use crate::model::{ChatMessage, MemoryEntry, Plan, UserProfile};
use crate::pattern::PatternAnalysis;

use super::Node;

/// What the caller hands to [`super::ConversationEngine::run_turn`].
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub user_id: String,
    pub message: String,
    /// Empty or missing falls back to the user id.
    pub session_id: Option<String>,
    /// Loaded from storage when absent.
    pub history: Option<Vec<ChatMessage>>,
    /// Client-side time of the user message, stored verbatim.
    pub timestamp: Option<String>,
}

impl TurnInput {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// The record threaded through every node of a turn.
#[derive(Debug, Clone)]
pub struct TurnState {
    pub user_id: String,
    pub session_id: String,
    pub user_input: String,
    pub user_timestamp: Option<String>,
    pub history: Vec<ChatMessage>,
    pub(super) history_supplied: bool,

    pub profile: UserProfile,
    /// Latest long-term memories, oldest first.
    pub memories: Vec<MemoryEntry>,
    pub memory_context: String,

    pub crisis: Option<CrisisVerdict>,
    pub intent: Option<IntentResult>,
    pub route: Route,
    pub need_search: bool,
    pub rag_context: String,
    pub search_results: Option<String>,

    pub plan: Option<Plan>,
    pub need_report: bool,
    pub inquiry: Option<InquiryResult>,
    pub need_pattern_analysis: bool,
    pub pattern: Option<PatternAnalysis>,
    pub report_generated: bool,

    pub response: String,
    pub emotion: String,

    pub visited: Vec<Node>,
    pub timings: BTreeMap<String, u64>,
}

impl TurnState {
    pub fn new(input: TurnInput) -> Self {
        let session_id = input.session_id.unwrap_or_default();
        Self {
            user_id: input.user_id,
            session_id,
            user_input: input.message,
            user_timestamp: input.timestamp,
            history_supplied: input.history.is_some(),
            history: input.history.unwrap_or_default(),
            profile: UserProfile::default(),
            memories: Vec::new(),
            memory_context: String::new(),
            crisis: None,
            intent: None,
            route: Route::Direct,
            need_search: false,
            rag_context: String::new(),
            search_results: None,
            plan: None,
            need_report: false,
            inquiry: None,
            need_pattern_analysis: false,
            pattern: None,
            report_generated: false,
            response: String::new(),
            emotion: "neutral".to_string(),
            visited: Vec::new(),
            timings: BTreeMap::new(),
        }
    }

    pub fn is_crisis(&self) -> bool {
        self.crisis.as_ref().is_some_and(|c| c.is_crisis)
    }

    pub fn pattern_analyzed(&self) -> bool {
        self.plan
            .as_ref()
            .is_some_and(|p| p.inquiry_status.pattern_analyzed)
    }

    pub fn completeness(&self) -> Option<u8> {
        self.inquiry.as_ref().map(|i| i.information_completeness)
    }
}

/// Result of one conversation turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub emotion: String,
    pub session_id: String,
    pub crisis_detected: bool,
    pub crisis_reason: Option<String>,
    pub route: Route,
    pub intent: Option<IntentResult>,
    pub inquiry: Option<InquiryResult>,
    pub pattern_analysis: Option<PatternAnalysis>,
    pub report_generated: bool,
    pub nodes: Vec<Node>,
    pub timings: BTreeMap<String, u64>,
}

impl From<TurnState> for TurnOutcome {
    fn from(state: TurnState) -> Self {
        let crisis_detected = state.is_crisis();
        Self {
            response: state.response,
            emotion: state.emotion,
            session_id: state.session_id,
            crisis_detected,
            crisis_reason: state.crisis.and_then(|c| c.reason),
            route: state.route,
            intent: state.intent,
            inquiry: state.inquiry,
            pattern_analysis: state.pattern,
            report_generated: state.report_generated,
            nodes: state.visited,
            timings: state.timings,
        }
    }
}
