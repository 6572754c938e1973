/// HTTP/JSON 接口
///
/// 所有路由挂载在 /api 下；异步操作返回 `{ "request_id": ... }`，
/// 调用方通过 /api/requests/:id 查询结果

pub mod disks;
pub mod nics;
pub mod requests;
pub mod switches;
pub mod vms;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::app_state::AppState;
use crate::db::models::request::RequestAccepted;

/// 所有 API 路由（统一入口）
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/vms", vms::vm_routes())
        .nest("/switches", switches::switch_routes())
        .nest("/nics", nics::nic_routes())
        .nest("/disks", disks::disk_routes())
        .nest("/requests", requests::request_routes())
}

/// API 错误响应
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] common::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        use common::Error;
        match &self.0 {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) | Error::InvalidState(_) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("请求处理失败: {}", self.0);
        }

        let body = Json(ErrorResponse {
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message: self.0.to_string(),
        });

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// 异步操作已受理
pub(crate) fn accepted(request_id: String) -> (StatusCode, Json<RequestAccepted>) {
    (StatusCode::ACCEPTED, Json(RequestAccepted { request_id }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    pub(crate) fn app(state: AppState) -> Router {
        Router::new().nest("/api", api_routes()).with_state(state)
    }

    /// 发送一个 JSON 请求，返回状态码和响应体
    pub(crate) async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[test]
    fn test_error_status_mapping() {
        use common::Error;
        let cases = [
            (Error::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::InvalidState("x".into()), StatusCode::CONFLICT),
            (Error::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
