use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use zhiji_core::error::ZhijiError;

/// JSON error body: `{"error_code": <status>, "error_message": <text>}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }

    /// The generic 400 for absent or empty required fields.
    pub fn missing_params() -> Self {
        Self::bad_request("缺少必要参数")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error_code": self.status.as_u16(),
            "error_message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ZhijiError> for ApiError {
    fn from(err: ZhijiError) -> Self {
        match &err {
            ZhijiError::NotFound(_) => Self::not_found(err.to_string()),
            ZhijiError::InvalidInput(_) => Self::bad_request(err.to_string()),
            _ => {
                tracing::error!("api error: {}", err);
                Self::internal(format!("服务器内部错误: {err}"))
            }
        }
    }
}

/// Malformed bodies and query strings are validation failures.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!("rejected request body: {}", rejection.body_text());
        Self::bad_request(format!("请求格式无效: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(format!("请求参数无效: {}", rejection.body_text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_body_shape() {
        let resp = ApiError::missing_params().into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error_code"], 400);
        assert_eq!(json["error_message"], "缺少必要参数");
    }

    #[test]
    fn test_core_error_mapping() {
        assert_eq!(
            ApiError::from(ZhijiError::NotFound("event e1".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(ZhijiError::InvalidInput("bad id".into())).status,
            StatusCode::BAD_REQUEST
        );
        let err = ApiError::from(ZhijiError::Storage("disk full".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.contains("disk full"));
    }
}
