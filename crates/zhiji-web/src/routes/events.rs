use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use zhiji_core::model::{ChatMessage, Event, EventUpdate};

use super::required;
use crate::error::ApiError;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/events/extract", post(extract))
        .route("/api/events", get(list))
        .route(
            "/api/events/{id}",
            get(get_event).put(update_event).delete(delete_event),
        )
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub session_id: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
}

async fn extract(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExtractRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(req) = payload?;
    let session_id = required(req.session_id.as_deref())?;
    let conversation = match req.messages.filter(|m| !m.is_empty()) {
        Some(messages) => messages,
        None => state.store.get_chat_history(session_id, None).await?,
    };
    let events = state
        .events
        .extract_and_store(&state.store, session_id, &conversation)
        .await?;
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub session_id: Option<String>,
    pub status: Option<String>,
    pub primary_type: Option<String>,
}

fn matches(event: &Event, status: Option<&str>, primary_type: Option<&str>) -> bool {
    status.map_or(true, |s| event.status == s)
        && primary_type.map_or(true, |t| event.primary_type == t)
}

async fn list(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(q) = query?;
    let session_id = required(q.session_id.as_deref())?;
    let status = q.status.as_deref().filter(|s| !s.is_empty());
    let primary_type = q.primary_type.as_deref().filter(|s| !s.is_empty());
    let events: Vec<Event> = state
        .store
        .get_events(session_id)
        .await?
        .into_iter()
        .filter(|e| matches(e, status, primary_type))
        .collect();
    Ok(Json(serde_json::json!({
        "session_id": session_id,
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<Event>, ApiError> {
    let Query(q) = query?;
    let session_id = required(q.session_id.as_deref())?;
    state
        .store
        .find_event(session_id, &id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("事件不存在: {id}")))
}

async fn update_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
    payload: Result<Json<EventUpdate>, JsonRejection>,
) -> Result<Json<Event>, ApiError> {
    let Query(q) = query?;
    let Json(update) = payload?;
    let session_id = required(q.session_id.as_deref())?;
    let event = state.store.update_event(session_id, &id, update).await?;
    tracing::info!(session_id, event_id = %id, "updated event");
    Ok(Json(event))
}

async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    query: Result<Query<SessionQuery>, QueryRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Query(q) = query?;
    let session_id = required(q.session_id.as_deref())?;
    state.store.delete_event(session_id, &id).await?;
    tracing::info!(session_id, event_id = %id, "deleted event");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use zhiji_core::llm::ScriptedGenerator;
    use zhiji_core::model::Role;

    const REPLY: &str = r#"{"events": [
        {"primaryType": "emotional", "subType": "emotionalLow", "title": "情绪低落", "content": "最近一直很低落"},
        {"primaryType": "physiological", "subType": "sleepIssues", "title": "失眠", "content": "晚上睡不着"}
    ]}"#;

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(b) => builder
                .header("content-type", "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn seeded() -> (axum::Router, Arc<AppState>) {
        let state = test_state(Some(Arc::new(ScriptedGenerator::new(REPLY))));
        state
            .store
            .save_message("s1", "u1", Role::User, "最近心情很差，晚上也睡不着", None)
            .await
            .unwrap();
        state
            .store
            .save_message("s1", "u1", Role::Agent, "这种状态持续多久了？", None)
            .await
            .unwrap();
        (crate::routes::router().with_state(state.clone()), state)
    }

    #[tokio::test]
    async fn test_extract_from_stored_history() {
        let (app, state) = seeded().await;
        let resp = app
            .oneshot(post_json("/api/events/extract", json!({"session_id": "s1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["events"].as_array().unwrap().len(), 2);
        assert_eq!(json["events"][0]["dialogContent"], "最近心情很差，晚上也睡不着");
        assert_eq!(state.store.get_events("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (app, _) = seeded().await;
        app.clone()
            .oneshot(post_json("/api/events/extract", json!({"session_id": "s1"})))
            .await
            .unwrap();

        let resp = app
            .clone()
            .oneshot(get_request("/api/events?session_id=s1&primary_type=physiological"))
            .await
            .unwrap();
        let json = body_json(resp.into_body()).await;
        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["title"], "失眠");

        let resp = app
            .oneshot(get_request("/api/events?session_id=s1&status=resolved"))
            .await
            .unwrap();
        let json = body_json(resp.into_body()).await;
        assert!(json["events"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_update_delete() {
        let (app, state) = seeded().await;
        app.clone()
            .oneshot(post_json("/api/events/extract", json!({"session_id": "s1"})))
            .await
            .unwrap();
        let id = state.store.get_events("s1").await.unwrap()[0].id.clone();

        let resp = app
            .clone()
            .oneshot(get_request(&format!("/api/events/{id}?session_id=s1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["id"], id.as_str());

        let resp = app
            .clone()
            .oneshot(request(
                "PUT",
                &format!("/api/events/{id}?session_id=s1"),
                Some(json!({"status": "resolved"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["status"], "resolved");

        let resp = app
            .clone()
            .oneshot(request("DELETE", &format!("/api/events/{id}?session_id=s1"), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp.into_body()).await["deleted"], id.as_str());

        for method in ["GET", "DELETE"] {
            let resp = app
                .clone()
                .oneshot(request(method, &format!("/api/events/{id}?session_id=s1"), None))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
        let resp = app
            .oneshot(request(
                "PUT",
                &format!("/api/events/{id}?session_id=s1"),
                Some(json!({"title": "x"})),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_session_is_400() {
        let resp = test_router(None).oneshot(get_request("/api/events")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
