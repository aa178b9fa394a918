use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use zhiji_core::graph::TurnInput;
use zhiji_core::model::{iso_now, ChatMessage};

use super::{message_id, required};
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat/history", get(history))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    pub user_id: Option<String>,
    pub message: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: Option<String>,
    pub history: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message_id: String,
    pub content: String,
    pub emotion: String,
    pub timestamp: String,
    pub session_id: String,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = payload?;
    let user_id = required(req.user_id.as_deref())?.to_string();
    let message = required(req.message.as_deref())?.to_string();
    let session_id = req
        .session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = state
        .engine
        .run_turn(TurnInput {
            user_id,
            message,
            session_id: Some(session_id),
            // An empty list means "use what is stored".
            history: req.history.filter(|h| !h.is_empty()),
            timestamp: req.timestamp,
        })
        .await?;

    Ok(Json(ChatResponse {
        message_id: message_id(),
        content: outcome.response,
        emotion: outcome.emotion,
        timestamp: iso_now(),
        session_id: outcome.session_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

async fn history(
    State(state): State<Arc<AppState>>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(q) = query?;
    required(q.user_id.as_deref())?;
    let session_id = required(q.session_id.as_deref())?;

    if !state.store.session_exists(session_id).await? {
        return Err(ApiError::not_found(format!("会话不存在: {session_id}")));
    }
    let messages = state.store.get_chat_history(session_id, q.limit).await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "messages": messages,
    })))
}
