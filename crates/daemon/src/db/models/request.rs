/// 异步请求数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// 请求模型
///
/// 同一 target_id 最多只有一条 complete = false 的记录
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub target_id: String,
    pub kind: String, // vm_start, vm_stop, vm_delete, nic_clone, disk_wipe
    pub payload: JsonValue,

    pub complete: bool,
    pub successful: bool,
    pub error_message: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub started_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// 请求已受理响应
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestAccepted {
    pub request_id: String,
}

/// 请求状态响应
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestStatusResponse {
    pub id: String,
    pub complete: bool,
    pub successful: bool,
}

/// 请求详情响应
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestResponse {
    pub id: String,
    pub target_id: String,
    pub kind: String,
    pub payload: JsonValue,
    pub complete: bool,
    pub successful: bool,
    pub error_message: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<Model> for RequestResponse {
    fn from(request: Model) -> Self {
        Self {
            id: request.id,
            target_id: request.target_id,
            kind: request.kind,
            payload: request.payload,
            complete: request.complete,
            successful: request.successful,
            error_message: request.error_message,
            created_at: request.created_at.to_rfc3339(),
            started_at: request.started_at.map(|t| t.to_rfc3339()),
            completed_at: request.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}
