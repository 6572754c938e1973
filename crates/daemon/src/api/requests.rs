/// 异步请求查询接口

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::ApiResult;
use crate::app_state::AppState;
use crate::db::models::request::{RequestResponse, RequestStatusResponse};
use crate::services::RequestService;

#[derive(Debug, Deserialize)]
pub struct ListRequestsQuery {
    pub target_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub removed: u64,
}

pub fn request_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_requests))
        .route("/completed", delete(clear_completed))
        .route("/:id", get(get_request_status))
        .route("/:id/detail", get(get_request))
}

/// GET /api/requests/:id
pub async fn get_request_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestStatusResponse>> {
    Ok(Json(RequestService::new(state).get_status(&id).await?))
}

/// GET /api/requests/:id/detail
pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestResponse>> {
    Ok(Json(RequestService::new(state).get_request(&id).await?))
}

/// GET /api/requests?target_id=xxx
pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
) -> ApiResult<Json<Vec<RequestResponse>>> {
    Ok(Json(RequestService::new(state).list_for_target(&query.target_id).await?))
}

/// DELETE /api/requests/completed
pub async fn clear_completed(State(state): State<AppState>) -> ApiResult<Json<ClearedResponse>> {
    let removed = RequestService::new(state).clear_completed().await?;
    Ok(Json(ClearedResponse { removed }))
}
