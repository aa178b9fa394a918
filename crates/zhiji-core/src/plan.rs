//! Per-session plan maintenance.

use std::sync::Arc;

use crate::json::extract_json;
use crate::llm::{chat_with_timeout, LlmMessage, TextGenerator};
use crate::model::{ChatMessage, Plan};
use crate::storage::JsonStore;

/// Phrases that ask for the confidant report instead of a normal reply.
pub const REPORT_KEYWORDS: &[&str] = &[
    "知己报告",
    "知己分析报告",
    "生成报告",
    "我的报告",
    "心理分析报告",
    "分析报告",
    "知己报告生成",
];

/// Inputs too small to be worth a plan update.
pub const SIMPLE_INPUTS: &[&str] = &["你好", "谢谢", "好的", "嗯", "是的", "不是"];

const SYSTEM_PROMPT: &str = "你是一个对话计划分析器。根据用户的输入和历史对话，更新对话计划。\n\
返回JSON格式的计划，包含以下字段：user_intent, current_state, steps, context, inquiry_status。\n\
请保持JSON格式的完整性。";

pub fn is_report_request(text: &str) -> bool {
    let lower = text.to_lowercase();
    REPORT_KEYWORDS.iter().any(|k| lower.contains(k))
}

pub fn is_simple_input(text: &str) -> bool {
    SIMPLE_INPUTS.contains(&text.trim())
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanUpdate {
    /// The user asked for a report; no plan work was done.
    ReportRequested,
    Updated(Plan),
}

pub struct PlanService {
    llm: Option<Arc<dyn TextGenerator>>,
    store: Arc<JsonStore>,
    attempts: usize,
    timeout_secs: u64,
}

impl PlanService {
    pub fn new(
        llm: Option<Arc<dyn TextGenerator>>,
        store: Arc<JsonStore>,
        attempts: usize,
        timeout_secs: u64,
    ) -> Self {
        Self {
            llm,
            store,
            attempts: attempts.max(1),
            timeout_secs,
        }
    }

    /// The stored plan, or a fresh default when there is none or it cannot
    /// be read.
    pub async fn current(&self, session_id: &str) -> Plan {
        match self.store.get_plan(session_id).await {
            Ok(Some(plan)) => plan,
            Ok(None) => Plan::new_default(),
            Err(e) => {
                tracing::warn!(session_id, "failed to load plan: {e}");
                Plan::new_default()
            }
        }
    }

    /// Ask the LLM to revise the session plan for this turn.
    ///
    /// A reply without JSON keeps the previous plan. When every attempt
    /// fails the basic plan is used, keeping the previous inquiry status.
    pub async fn update(&self, session_id: &str, user_input: &str, history: &[ChatMessage]) -> PlanUpdate {
        if is_report_request(user_input) {
            tracing::info!(session_id, "report requested, skipping plan update");
            return PlanUpdate::ReportRequested;
        }

        let mut plan = self.current(session_id).await;
        let Some(llm) = &self.llm else {
            plan.touch();
            return PlanUpdate::Updated(plan);
        };

        let plan_json = serde_json::to_string(&plan).unwrap_or_default();
        let history_json = serde_json::to_string(history).unwrap_or_default();
        let messages = [
            LlmMessage::system(SYSTEM_PROMPT),
            LlmMessage::user(format!(
                "Current plan: {plan_json}\n\nCurrent message: {user_input}\n\nHistory: {history_json}"
            )),
        ];

        for attempt in 1..=self.attempts {
            match chat_with_timeout(llm.as_ref(), &messages, self.timeout_secs, "plan update").await {
                Ok(reply) => {
                    let merged = extract_json(&reply).and_then(|proposal| plan.merge_proposal(&proposal));
                    return match merged {
                        Some(next) => {
                            if let Err(e) = self.store.save_plan(session_id, &next).await {
                                tracing::warn!(session_id, "failed to save plan: {e}");
                            }
                            PlanUpdate::Updated(next)
                        }
                        None => {
                            tracing::debug!(session_id, "plan reply had no usable JSON, keeping plan");
                            plan.touch();
                            PlanUpdate::Updated(plan)
                        }
                    };
                }
                Err(e) => {
                    tracing::warn!(session_id, attempt, attempts = self.attempts, "plan update failed: {e}");
                }
            }
        }

        tracing::warn!(session_id, "plan update exhausted retries, using basic plan");
        let mut basic = Plan::basic();
        basic.inquiry_status = plan.inquiry_status;
        PlanUpdate::Updated(basic)
    }
}
