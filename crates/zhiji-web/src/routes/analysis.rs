use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use zhiji_core::report::UserReport;

use super::required;
use crate::error::ApiError;
use crate::AppState;

const DEFAULT_DAYS: u32 = 30;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/analysis/user-report", post(user_report))
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub user_id: Option<String>,
    pub days: Option<u32>,
}

async fn user_report(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> Result<Json<UserReport>, ApiError> {
    let Json(req) = payload?;
    let user_id = required(req.user_id.as_deref())?;
    let days = req.days.filter(|d| *d > 0).unwrap_or(DEFAULT_DAYS);
    let report = state.reports.generate_user_report(user_id, days).await?;
    if report.is_degraded() {
        tracing::warn!(user_id, "user report fell back to statistics only");
    }
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;
    use zhiji_core::llm::ScriptedGenerator;
    use zhiji_core::model::Role;

    #[tokio::test]
    async fn test_missing_user_is_400() {
        let resp = test_router(None)
            .oneshot(post_json("/api/analysis/user-report", json!({"days": 7})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_report_with_llm_analysis() {
        let reply = r#"{"overallAssessment": "整体稳定", "riskLevel": "low", "recommendations": ["保持作息"]}"#;
        let state = test_state(Some(Arc::new(ScriptedGenerator::new(reply))));
        state
            .store
            .save_message("s1", "u1", Role::User, "最近还不错", None)
            .await
            .unwrap();
        let app = crate::routes::router().with_state(state);

        let resp = app
            .oneshot(post_json("/api/analysis/user-report", json!({"user_id": "u1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["analysis_period"]["days"], 30);
        assert_eq!(json["ai_analysis"]["riskLevel"], "low");
        assert_eq!(json["metadata"]["sessions_analyzed"], 1);
    }

    #[tokio::test]
    async fn test_report_without_llm_is_degraded() {
        let resp = test_router(None)
            .oneshot(post_json("/api/analysis/user-report", json!({"user_id": "u2", "days": 7})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["analysis_period"]["days"], 7);
        assert_eq!(json["ai_analysis"]["summary"]["riskLevel"], "unknown");
        assert!(json["ai_analysis"]["error"].is_string());
    }

    #[tokio::test]
    async fn test_window_past_calendar_is_400() {
        let resp = test_router(None)
            .oneshot(post_json(
                "/api/analysis/user-report",
                json!({"user_id": "u1", "days": 4_000_000_000u32}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp.into_body()).await;
        assert_eq!(json["error_code"], 400);
    }
}
