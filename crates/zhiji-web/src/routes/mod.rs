pub mod analysis;
pub mod chat;
pub mod events;
pub mod mood;

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;

use crate::error::ApiError;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .merge(chat::routes())
        .merge(mood::routes())
        .merge(events::routes())
        .merge(analysis::routes())
        .fallback(not_found)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let rag_ready = match &state.rag {
        Some(rag) => rag.is_ready().await,
        None => false,
    };
    Json(serde_json::json!({
        "status": "ok",
        "llm": state.llm.as_ref().map(|l| l.model_name().to_string()),
        "rag": rag_ready,
        "search": state.search.is_enabled(),
        "embedding_provider": state.embedding_provider,
    }))
}

async fn not_found() -> ApiError {
    ApiError::not_found("接口不存在")
}

/// Non-empty trimmed value of an optional request field.
pub(crate) fn required(value: Option<&str>) -> Result<&str, ApiError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(ApiError::missing_params)
}

/// `msg_` followed by eight hex digits.
pub(crate) fn message_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("msg_{}", &hex[..8])
}
