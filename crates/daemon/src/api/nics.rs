/// 虚拟网卡接口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use super::{accepted, ApiResult};
use crate::app_state::AppState;
use crate::db::models::nic::{AttachSwitchDto, AttachVmDto, CloneNicDto, CreateNicDto, NicResponse};
use crate::services::NicService;

#[derive(Debug, Deserialize)]
pub struct ListNicsQuery {
    pub vm_id: Option<String>,
}

pub fn nic_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_nics).post(create_nic))
        .route("/:id", get(get_nic).delete(delete_nic))
        .route("/:id/clone", post(clone_nic))
        .route("/:id/switch", put(attach_switch))
        .route("/:id/vm", put(attach_vm))
}

/// POST /api/nics
pub async fn create_nic(
    State(state): State<AppState>,
    Json(dto): Json<CreateNicDto>,
) -> ApiResult<impl IntoResponse> {
    let nic = NicService::new(state).create_nic(dto).await?;
    Ok((StatusCode::CREATED, Json(nic)))
}

/// GET /api/nics?vm_id=xxx
pub async fn list_nics(
    State(state): State<AppState>,
    Query(query): Query<ListNicsQuery>,
) -> ApiResult<Json<Vec<NicResponse>>> {
    Ok(Json(NicService::new(state).list_nics(query.vm_id.as_deref()).await?))
}

pub async fn get_nic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NicResponse>> {
    Ok(Json(NicService::new(state).get_nic(&id).await?))
}

pub async fn delete_nic(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    NicService::new(state).delete_nic(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/nics/:id/clone
pub async fn clone_nic(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<CloneNicDto>,
) -> ApiResult<impl IntoResponse> {
    let request_id = NicService::new(state).request_clone(&id, dto).await?;
    Ok(accepted(request_id))
}

/// PUT /api/nics/:id/switch
pub async fn attach_switch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<AttachSwitchDto>,
) -> ApiResult<Json<NicResponse>> {
    Ok(Json(NicService::new(state).attach_switch(&id, dto.switch_id).await?))
}

/// PUT /api/nics/:id/vm
pub async fn attach_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<AttachVmDto>,
) -> ApiResult<Json<NicResponse>> {
    Ok(Json(NicService::new(state).attach_vm(&id, dto.vm_id).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{app, call};
    use crate::app_state::test_state;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_nic_endpoints() {
        let (state, _kernel) = test_state().await;
        let app = app(state);

        let (_, switch) = call(
            &app,
            "POST",
            "/api/switches",
            Some(json!({ "name": "bnet0", "switch_type": "NG" })),
        )
        .await;
        let switch_id = switch["id"].as_str().unwrap();

        let (status, nic) = call(
            &app,
            "POST",
            "/api/nics",
            Some(json!({ "name": "net0", "mac": "AUTO", "dev_type": "NETGRAPH", "rate_limit": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(nic["rate_limit"], false);
        let id = nic["id"].as_str().unwrap().to_string();

        let (status, nic) = call(
            &app,
            "PUT",
            &format!("/api/nics/{}/switch", id),
            Some(json!({ "switch_id": switch_id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(nic["switch_id"], switch_id);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/nics/{}/clone", id),
            Some(json!({ "name": "net1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["request_id"].is_string());
    }
}
