//! The per-turn conversation state machine.
//!
//! A turn walks a fixed DAG of [`Node`]s. Each node takes the
//! [`TurnState`] by value and hands back the updated record; edges are
//! chosen by [`routing::next`] from the state alone. Node ranks follow the
//! declaration order below and every edge must move to a higher rank, so a
//! turn visits each node at most once and always terminates.

mod nodes;
pub mod routing;
pub mod state;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::chat_log::ChatLogger;
use crate::config::{ChatConfig, ZhijiConfig};
use crate::crisis::CrisisDetector;
use crate::error::{Result, ZhijiError};
use crate::events::EventExtractor;
use crate::inquiry::InquiryService;
use crate::intent::IntentRouter;
use crate::llm::TextGenerator;
use crate::pattern::PatternAnalyzer;
use crate::plan::PlanService;
use crate::rag::RagService;
use crate::report::ReportService;
use crate::search::SearchService;
use crate::storage::{safe_id, JsonStore};

pub use state::{TurnInput, TurnOutcome, TurnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Preprocess,
    CrisisCheck,
    IntentAnalysis,
    RagRetrieval,
    WebSearch,
    ContextBuild,
    PlanUpdate,
    GuidedInquiry,
    PatternAnalysis,
    AnalysisReport,
    GenerateResponse,
    PostprocessSave,
}

impl Node {
    /// Topological position.
    pub fn rank(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::CrisisCheck => "crisis_check",
            Self::IntentAnalysis => "intent_analysis",
            Self::RagRetrieval => "rag_retrieval",
            Self::WebSearch => "web_search",
            Self::ContextBuild => "context_build",
            Self::PlanUpdate => "plan_update",
            Self::GuidedInquiry => "guided_inquiry",
            Self::PatternAnalysis => "pattern_analysis",
            Self::AnalysisReport => "analysis_report",
            Self::GenerateResponse => "generate_response",
            Self::PostprocessSave => "postprocess_save",
        }
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Days covered by a report requested from chat.
const REPORT_DAYS: u32 = 30;

/// Owns every service a turn touches.
pub struct ConversationEngine {
    store: Arc<JsonStore>,
    llm: Option<Arc<dyn TextGenerator>>,
    crisis: CrisisDetector,
    intent: IntentRouter,
    rag: Option<Arc<RagService>>,
    search: Arc<SearchService>,
    plans: PlanService,
    inquiry: InquiryService,
    patterns: PatternAnalyzer,
    reports: ReportService,
    events: Arc<EventExtractor>,
    chat_log: ChatLogger,
    chat: ChatConfig,
    chat_timeout: u64,
}

impl ConversationEngine {
    pub fn new(
        config: &ZhijiConfig,
        store: Arc<JsonStore>,
        llm: Option<Arc<dyn TextGenerator>>,
        rag: Option<Arc<RagService>>,
        search: Arc<SearchService>,
    ) -> Self {
        let t = &config.timeouts;
        Self {
            crisis: CrisisDetector::new(),
            intent: IntentRouter::new(llm.clone(), t.chat),
            plans: PlanService::new(llm.clone(), store.clone(), t.plan_retries, t.chat),
            inquiry: InquiryService::new(llm.clone(), store.clone(), t.chat),
            patterns: PatternAnalyzer::new(llm.clone(), t.analysis),
            reports: ReportService::new(llm.clone(), store.clone(), t.analysis),
            events: Arc::new(EventExtractor::new(llm.clone(), t.event)),
            chat_log: ChatLogger::from_config(config),
            chat: config.chat.clone(),
            chat_timeout: t.chat,
            store,
            llm,
            rag,
            search,
        }
    }

    pub fn store(&self) -> &Arc<JsonStore> {
        &self.store
    }

    /// Run one user message through the graph.
    ///
    /// Only validation and an illegal edge fail the turn; every node
    /// degrades to a fallback value instead. Ids are checked against the
    /// store's naming rule up front so a turn never runs without persisting.
    pub async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome> {
        if input.user_id.trim().is_empty() {
            return Err(ZhijiError::InvalidInput("user_id is required".into()));
        }
        if input.message.trim().is_empty() {
            return Err(ZhijiError::InvalidInput("message is required".into()));
        }
        safe_id("user", &input.user_id)?;
        if let Some(sid) = input.session_id.as_deref().filter(|s| !s.trim().is_empty()) {
            safe_id("session", sid)?;
        }

        let started = Instant::now();
        let mut state = TurnState::new(input);
        let mut node = Node::Preprocess;
        loop {
            let node_started = Instant::now();
            state = self.run_node(node, state).await;
            let elapsed_ms = node_started.elapsed().as_millis() as u64;
            tracing::debug!(node = %node, elapsed_ms, "graph node finished");
            state.timings.insert(node.to_string(), elapsed_ms);
            state.visited.push(node);

            match routing::next(node, &state) {
                Some(to) if to.rank() > node.rank() => node = to,
                Some(to) => {
                    return Err(ZhijiError::Graph(format!("edge {node} -> {to} does not advance")));
                }
                None => break,
            }
        }
        state
            .timings
            .insert("total".to_string(), started.elapsed().as_millis() as u64);
        tracing::info!(
            session_id = %state.session_id,
            route = %state.route,
            crisis = state.is_crisis(),
            nodes = state.visited.len(),
            "turn complete"
        );
        Ok(state.into())
    }

    async fn run_node(&self, node: Node, state: TurnState) -> TurnState {
        match node {
            Node::Preprocess => self.preprocess(state).await,
            Node::CrisisCheck => self.crisis_check(state).await,
            Node::IntentAnalysis => self.intent_analysis(state).await,
            Node::RagRetrieval => self.rag_retrieval(state).await,
            Node::WebSearch => self.web_search(state).await,
            Node::ContextBuild => self.context_build(state),
            Node::PlanUpdate => self.plan_update(state).await,
            Node::GuidedInquiry => self.guided_inquiry(state).await,
            Node::PatternAnalysis => self.pattern_analysis(state).await,
            Node::AnalysisReport => self.analysis_report(state).await,
            Node::GenerateResponse => self.generate_response(state).await,
            Node::PostprocessSave => self.postprocess_save(state).await,
        }
    }
}
