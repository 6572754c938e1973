/// 虚拟机管理接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use super::{accepted, ApiResult};
use crate::app_state::AppState;
use crate::db::models::vm::{CreateVmDto, VmResponse};
use crate::db::models::vm_config::UpdateVmConfigDto;
use crate::services::VmService;

/// VM 路由
pub fn vm_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_vms).post(create_vm))
        .route("/:id", get(get_vm).put(update_vm).delete(delete_vm))
        .route("/:id/start", post(start_vm))
        .route("/:id/stop", post(stop_vm))
}

/// POST /api/vms
pub async fn create_vm(
    State(state): State<AppState>,
    Json(dto): Json<CreateVmDto>,
) -> ApiResult<impl IntoResponse> {
    let vm = VmService::new(state).create_vm(dto).await?;
    Ok((StatusCode::CREATED, Json(vm)))
}

/// GET /api/vms
pub async fn list_vms(State(state): State<AppState>) -> ApiResult<Json<Vec<VmResponse>>> {
    Ok(Json(VmService::new(state).list_vms().await?))
}

/// GET /api/vms/:id
pub async fn get_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<VmResponse>> {
    Ok(Json(VmService::new(state).get_vm(&id).await?))
}

/// PUT /api/vms/:id，只修改配置
pub async fn update_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<UpdateVmConfigDto>,
) -> ApiResult<Json<VmResponse>> {
    Ok(Json(VmService::new(state).update_config(&id, dto).await?))
}

/// DELETE /api/vms/:id
pub async fn delete_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let request_id = VmService::new(state).request_delete(&id).await?;
    Ok(accepted(request_id))
}

/// POST /api/vms/:id/start
pub async fn start_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let request_id = VmService::new(state).request_start(&id).await?;
    Ok(accepted(request_id))
}

/// POST /api/vms/:id/stop
pub async fn stop_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let request_id = VmService::new(state).request_stop(&id).await?;
    Ok(accepted(request_id))
}
