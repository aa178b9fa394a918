use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use zhiji_core::model::{iso_now, MoodAnalysis};

use super::{message_id, required};
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/mood", post(analyze_mood))
}

#[derive(Debug, Deserialize)]
pub struct MoodRequest {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Value,
}

#[derive(Debug, Serialize)]
pub struct MoodResponse {
    pub message_id: String,
    #[serde(flatten)]
    pub analysis: MoodAnalysis,
    pub timestamp: String,
    pub session_id: String,
}

/// Message texts from a list of strings or `{content}` objects.
fn message_texts(messages: &Value) -> Option<Vec<String>> {
    let items = messages.as_array().filter(|a| !a.is_empty())?;
    let texts: Vec<String> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => o.get("content").and_then(Value::as_str),
            _ => None,
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!texts.is_empty()).then_some(texts)
}

async fn analyze_mood(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MoodRequest>, JsonRejection>,
) -> Result<Json<MoodResponse>, ApiError> {
    let Json(req) = payload?;
    let user_id = required(req.user_id.as_deref())?;
    let session_id = required(req.session_id.as_deref())?;
    let texts = message_texts(&req.messages).ok_or_else(|| ApiError::bad_request("消息内容无效"))?;

    let analysis = state.mood.analyze(&texts).await;
    if state.store.session_exists(session_id).await? {
        state.store.save_mood(session_id, user_id, analysis.clone()).await?;
    } else {
        tracing::debug!(session_id, "mood result not stored: unknown session");
    }

    Ok(Json(MoodResponse {
        message_id: message_id(),
        analysis,
        timestamp: iso_now(),
        session_id: session_id.to_string(),
    }))
}
