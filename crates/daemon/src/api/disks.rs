/// 磁盘接口

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
use crate::db::models::disk::{CreateDiskDto, DiskResponse};
use crate::db::models::nic::AttachVmDto;
use crate::services::DiskService;

#[derive(Debug, Deserialize)]
pub struct ListDisksQuery {
    pub vm_id: Option<String>,
}

pub fn disk_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_disks).post(create_disk))
        .route("/:id", get(get_disk))
        .route("/:id/wipe", post(wipe_disk))
        .route("/:id/vm", put(attach_vm))
}

pub async fn create_disk(
    State(state): State<AppState>,
    Json(dto): Json<CreateDiskDto>,
) -> ApiResult<impl IntoResponse> {
    let disk = DiskService::new(state).create_disk(dto).await?;
    Ok((StatusCode::CREATED, Json(disk)))
}

pub async fn list_disks(
    State(state): State<AppState>,
    Query(query): Query<ListDisksQuery>,
) -> ApiResult<Json<Vec<DiskResponse>>> {
    Ok(Json(DiskService::new(state).list_disks(query.vm_id.as_deref()).await?))
}

pub async fn get_disk(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DiskResponse>> {
    Ok(Json(DiskService::new(state).get_disk(&id).await?))
}

/// POST /api/disks/:id/wipe
pub async fn wipe_disk(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let request_id = DiskService::new(state).request_wipe(&id).await?;
    Ok(accepted(request_id))
}

/// PUT /api/disks/:id/vm
pub async fn attach_vm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<AttachVmDto>,
) -> ApiResult<Json<DiskResponse>> {
    Ok(Json(DiskService::new(state).attach_vm(&id, dto.vm_id).await?))
}
