//! Node bodies. Each one returns the state it was given, updated; failures
//! inside a node become an explicit fallback value and a warning.

use std::sync::Arc;

use crate::chat_log::ChatLogEntry;
use crate::emotion::{extract_emotion, sentiment_score};
use crate::inquiry::{needs_pattern_analysis, INQUIRY_HISTORY_LIMIT, SUFFICIENT_COMPLETENESS};
use crate::intent::Route;
use crate::llm::{chat_with_timeout, LlmMessage};
use crate::model::{iso_now, local_timestamp, tail, ChatMessage, EmotionRecord, MemoryEntry, Plan, Role};
use crate::plan::PlanUpdate;
use crate::report::basic_report;
use crate::search::should_search;

use super::state::TurnState;
use super::{ConversationEngine, REPORT_DAYS};

const MEMORY_CONTEXT_ENTRIES: usize = 5;

pub(super) const COUNSELOR_PROMPT: &str = r#"你是一位专业的心理咨询师，名叫"知己咨询师"。你的目标是通过对话帮助用户解决心理困扰、情绪问题，并提供专业的心理支持。

请注意以下指导原则：
1. 保持共情、尊重和支持的态度
2. 提供循证的心理学建议
3. 不要给出医疗诊断或处方
4. 当用户需要专业医疗帮助时，建议他们寻求专业医生的帮助
5. 回复要简洁、清晰，易于用户理解
6. 适当使用开放式问题鼓励用户表达"#;

pub(super) const FALLBACK_REPLY: &str = "抱歉，我现在无法正常回应，请稍后再试。如果您感到非常难受，请拨打心理援助热线 400-161-9995。";

const EMPTY_REPLY: &str = "抱歉，暂时无法回答。";

impl ConversationEngine {
    pub(super) async fn preprocess(&self, mut state: TurnState) -> TurnState {
        state.user_input = state.user_input.trim().to_string();
        if state.session_id.trim().is_empty() {
            state.session_id = state.user_id.clone();
        }
        state.need_search = should_search(&state.user_input);

        if !state.history_supplied {
            match self.store.get_chat_history(&state.session_id, None).await {
                Ok(history) => state.history = history,
                Err(e) => tracing::warn!(session_id = %state.session_id, "failed to load history: {e}"),
            }
        }
        match self.store.get_profile(&state.user_id).await {
            Ok(profile) => state.profile = profile,
            Err(e) => tracing::warn!(user_id = %state.user_id, "failed to load profile: {e}"),
        }
        match self
            .store
            .get_memories(&state.user_id, Some(MEMORY_CONTEXT_ENTRIES))
            .await
        {
            Ok(memories) => state.memories = memories,
            Err(e) => tracing::warn!(user_id = %state.user_id, "failed to load memories: {e}"),
        }
        state
    }

    pub(super) async fn crisis_check(&self, mut state: TurnState) -> TurnState {
        let verdict = self.crisis.detect(&state.user_input);
        if let Some(message) = verdict.safety_message() {
            tracing::warn!(
                user_id = %state.user_id,
                severity = %verdict.severity,
                "crisis language detected"
            );
            state.response = message;
            if let Some(line) = verdict.memory_line(&state.user_input) {
                let entry = MemoryEntry::new(line, Some(state.session_id.clone()));
                if let Err(e) = self.store.save_memory(&state.user_id, entry).await {
                    tracing::warn!(user_id = %state.user_id, "failed to record crisis memory: {e}");
                }
            }
        }
        state.crisis = Some(verdict);
        state
    }

    pub(super) async fn intent_analysis(&self, mut state: TurnState) -> TurnState {
        let intent = self.intent.analyze(&state.user_input, &state.history).await;
        state.route = intent.route();
        state.need_search = state.route == Route::WebSearch;
        tracing::debug!(route = %state.route, confidence = intent.confidence, "intent routed");
        state.intent = Some(intent);
        state
    }

    pub(super) async fn rag_retrieval(&self, mut state: TurnState) -> TurnState {
        let Some(rag) = &self.rag else {
            tracing::warn!("knowledge retrieval requested but RAG is disabled");
            return state;
        };
        if !rag.is_ready().await {
            tracing::warn!("knowledge base is not initialized, continuing without context");
            return state;
        }
        match rag.context_for_query(&state.user_input).await {
            Ok(context) => state.rag_context = context,
            Err(e) => tracing::warn!("knowledge retrieval failed: {e}"),
        }
        state
    }

    pub(super) async fn web_search(&self, mut state: TurnState) -> TurnState {
        state.search_results = Some(self.search.search(&state.user_input).await);
        state
    }

    pub(super) fn context_build(&self, mut state: TurnState) -> TurnState {
        state.memory_context = state
            .memories
            .iter()
            .map(|m| format!("{}: {}", m.time, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        state
    }

    pub(super) async fn plan_update(&self, mut state: TurnState) -> TurnState {
        match self
            .plans
            .update(&state.session_id, &state.user_input, &state.history)
            .await
        {
            PlanUpdate::ReportRequested => {
                state.need_report = true;
                state.plan = Some(self.plans.current(&state.session_id).await);
            }
            PlanUpdate::Updated(plan) => state.plan = Some(plan),
        }
        state
    }

    pub(super) async fn guided_inquiry(&self, mut state: TurnState) -> TurnState {
        let history_len = state.history.len();
        let analyzed = state.pattern_analyzed();

        if !self.chat.guided_inquiry {
            state.need_pattern_analysis =
                needs_pattern_analysis(self.chat.pattern_analysis, None, history_len, analyzed);
            return state;
        }
        if history_len > INQUIRY_HISTORY_LIMIT || analyzed {
            return state;
        }

        let result = self.inquiry.assess(&state.user_input, &state.history).await;
        tracing::debug!(
            completeness = result.information_completeness,
            stage = %result.current_stage,
            "inquiry assessed"
        );
        let plan = state.plan.get_or_insert_with(Plan::new_default);
        plan.inquiry_status.information_completeness = result.information_completeness;
        plan.inquiry_status.stage = result.current_stage.clone();
        if let Err(e) = self.store.save_plan(&state.session_id, plan).await {
            tracing::warn!(session_id = %state.session_id, "failed to save inquiry status: {e}");
        }
        self.inquiry.record(&state.session_id, &result).await;

        state.need_pattern_analysis = needs_pattern_analysis(
            self.chat.pattern_analysis,
            Some(result.information_completeness),
            history_len,
            analyzed,
        );
        state.inquiry = Some(result);
        state
    }

    pub(super) async fn pattern_analysis(&self, mut state: TurnState) -> TurnState {
        let context = state
            .plan
            .as_ref()
            .map(|p| p.context.clone())
            .unwrap_or_default();
        let analysis = self
            .patterns
            .analyze(
                &state.session_id,
                &state.user_input,
                &state.history,
                &context,
                state.inquiry.as_ref(),
            )
            .await;

        let plan = state.plan.get_or_insert_with(Plan::new_default);
        plan.inquiry_status.pattern_analyzed = true;
        plan.inquiry_status.pattern_analysis_completed_at = Some(iso_now());

        if let Err(e) = self.store.save_pattern(&state.session_id, &analysis).await {
            tracing::warn!(session_id = %state.session_id, "failed to save pattern analysis: {e}");
        }
        if let Err(e) = self.store.save_plan(&state.session_id, plan).await {
            tracing::warn!(session_id = %state.session_id, "failed to save plan: {e}");
        }
        tracing::info!(session_id = %state.session_id, "pattern analysis completed");

        state.need_report = self.chat.analysis_report
            && state
                .completeness()
                .is_some_and(|c| c >= SUFFICIENT_COMPLETENESS);
        state.pattern = Some(analysis);
        state
    }

    pub(super) async fn analysis_report(&self, mut state: TurnState) -> TurnState {
        state.response = if self.chat.analysis_report {
            self.reports.report_text(&state.user_id, REPORT_DAYS).await.0
        } else {
            tracing::warn!("analysis reports are disabled, using basic report");
            basic_report(&state.user_id, &self.reports.basic_stats(&state.user_id).await)
        };
        state.report_generated = true;
        state
    }

    pub(super) async fn generate_response(&self, mut state: TurnState) -> TurnState {
        let Some(llm) = &self.llm else {
            tracing::warn!("no language model configured, using fallback reply");
            state.response = FALLBACK_REPLY.to_string();
            return state;
        };

        let mut system = COUNSELOR_PROMPT.to_string();
        if !state.rag_context.is_empty() {
            system.push_str(&format!("\n\n专业知识参考：{}", state.rag_context));
        }
        if let Some(plan) = &state.plan {
            let plan_json = serde_json::to_string(plan).unwrap_or_default();
            system.push_str(&format!("\n\n当前对话计划：{plan_json}"));
        }
        if let Some(results) = &state.search_results {
            system.push_str(&format!("\n\n相关搜索信息：{results}"));
        }
        if !state.memory_context.is_empty() {
            system.push_str(&format!("\n\n相关记忆：{}", state.memory_context));
        }

        let mut messages = vec![LlmMessage::system(system)];
        messages.extend(
            tail(&state.history, self.chat.history_window)
                .iter()
                .map(ChatMessage::to_llm),
        );
        messages.push(LlmMessage::user(state.user_input.as_str()));

        match chat_with_timeout(llm.as_ref(), &messages, self.chat_timeout, "chat reply").await {
            Ok(reply) => {
                let reply = match reply.trim() {
                    "" => EMPTY_REPLY,
                    text => text,
                };
                let (content, emotion) = extract_emotion(reply);
                state.response = content;
                state.emotion = emotion;
            }
            Err(e) => {
                tracing::warn!(session_id = %state.session_id, "reply generation failed: {e}");
                state.response = FALLBACK_REPLY.to_string();
                state.emotion = "neutral".to_string();
            }
        }
        state
    }

    pub(super) async fn postprocess_save(&self, mut state: TurnState) -> TurnState {
        let uid = state.user_id.clone();
        let sid = state.session_id.clone();
        let score = sentiment_score(&state.user_input);

        let record = EmotionRecord {
            score,
            emotion: state.emotion.clone(),
            session_id: sid.clone(),
            timestamp: iso_now(),
        };
        match self.store.save_emotion(&uid, record).await {
            Ok(count) if count % self.chat.long_term_every == 0 => {
                let content = format!("用户: {}\n咨询师: {}", state.user_input, state.response);
                if let Err(e) = self
                    .store
                    .save_memory(&uid, MemoryEntry::new(content, Some(sid.clone())))
                    .await
                {
                    tracing::warn!(user_id = %uid, "failed to save long-term memory: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id = %uid, "failed to save emotion record: {e}"),
        }

        let emotion = state.emotion.clone();
        match self
            .store
            .update_profile(&uid, |p| {
                p.last_interaction = Some(local_timestamp());
                p.recent_emotion_score = Some(score);
                p.recent_emotion = Some(emotion);
            })
            .await
        {
            Ok(profile) => state.profile = profile,
            Err(e) => tracing::warn!(user_id = %uid, "failed to update profile: {e}"),
        }

        match self
            .store
            .save_message(&sid, &uid, Role::User, &state.user_input, state.user_timestamp.as_deref())
            .await
        {
            Ok(message) => state.history.push(message),
            Err(e) => tracing::warn!(session_id = %sid, "failed to save user message: {e}"),
        }
        match self
            .store
            .save_message(&sid, &uid, Role::Agent, &state.response, None)
            .await
        {
            Ok(message) => state.history.push(message),
            Err(e) => tracing::warn!(session_id = %sid, "failed to save reply: {e}"),
        }

        self.chat_log.log(&ChatLogEntry {
            timestamp: iso_now(),
            user_id: uid,
            session_id: sid.clone(),
            input: state.user_input.clone(),
            response: state.response.clone(),
            emotion: state.emotion.clone(),
            route: state.route.to_string(),
            crisis: state.is_crisis(),
            timings: state.timings.clone(),
        });

        let user_messages = state.history.iter().filter(|m| m.role == Role::User).count();
        if user_messages > 0 && user_messages % self.chat.event_every == 0 {
            let window = self.chat.event_every * 2;
            let conversation = tail(&state.history, window).to_vec();
            let extractor = Arc::clone(&self.events);
            let store = Arc::clone(&self.store);
            tokio::spawn(async move {
                match extractor.extract_and_store(&store, &sid, &conversation).await {
                    Ok(events) => tracing::debug!(session_id = %sid, count = events.len(), "background event extraction"),
                    Err(e) => tracing::warn!(session_id = %sid, "background event extraction failed: {e}"),
                }
            });
        }
        state
    }
}
