/// 虚拟交换机接口

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};

use super::ApiResult;
use crate::app_state::AppState;
use crate::db::models::switch::{CreateSwitchDto, SetUplinkDto, SwitchResponse};
use crate::services::SwitchService;

pub fn switch_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_switches).post(create_switch))
        .route("/:id", get(get_switch).delete(destroy_switch))
        .route("/:id/uplink", put(set_uplink).delete(unset_uplink))
}

/// POST /api/switches
pub async fn create_switch(
    State(state): State<AppState>,
    Json(dto): Json<CreateSwitchDto>,
) -> ApiResult<impl IntoResponse> {
    let switch = SwitchService::new(state).create_switch(dto).await?;
    Ok((StatusCode::CREATED, Json(switch)))
}

/// GET /api/switches
pub async fn list_switches(State(state): State<AppState>) -> ApiResult<Json<Vec<SwitchResponse>>> {
    Ok(Json(SwitchService::new(state).list_switches().await?))
}

/// GET /api/switches/:id
pub async fn get_switch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SwitchResponse>> {
    Ok(Json(SwitchService::new(state).get_switch(&id).await?))
}

/// DELETE /api/switches/:id
pub async fn destroy_switch(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    SwitchService::new(state).destroy_switch(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/switches/:id/uplink
pub async fn set_uplink(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(dto): Json<SetUplinkDto>,
) -> ApiResult<Json<SwitchResponse>> {
    Ok(Json(SwitchService::new(state).set_uplink(&id, dto).await?))
}

/// DELETE /api/switches/:id/uplink
pub async fn unset_uplink(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SwitchResponse>> {
    Ok(Json(SwitchService::new(state).unset_uplink(&id).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{app, call};
    use crate::app_state::test_state;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_switch_endpoints() {
        let (state, kernel) = test_state().await;
        let app = app(state);

        let (status, body) = call(
            &app,
            "POST",
            "/api/switches",
            Some(json!({ "name": "bnet0", "switch_type": "IF" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

        let (status, switch) = call(
            &app,
            "POST",
            "/api/switches",
            Some(json!({ "name": "bridge0", "switch_type": "IF" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = switch["id"].as_str().unwrap().to_string();

        let (status, switch) = call(
            &app,
            "PUT",
            &format!("/api/switches/{}/uplink", id),
            Some(json!({ "uplink": "em1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(switch["uplink"], "em1");
        assert_eq!(kernel.bridge_members("bridge0"), vec!["em1"]);

        let (status, switch) = call(&app, "DELETE", &format!("/api/switches/{}/uplink", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(switch["uplink"].is_null());

        let (status, _) = call(&app, "DELETE", &format!("/api/switches/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", &format!("/api/switches/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
