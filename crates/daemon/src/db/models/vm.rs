/// 虚拟机数据模型

use common::VmStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::vm_config::{UpdateVmConfigDto, VmConfigResponse};

/// 虚拟机模型
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vms")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub name: String,
    pub status: String, // stopped, starting, running, stopping
    /// bhyve 进程 pid，未运行时为 0
    pub pid: i64,
    pub description: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::vm_config::Entity")]
    Config,
}

impl Related<super::vm_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Config.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn vm_status(&self) -> common::Result<VmStatus> {
        self.status.parse()
    }

    pub fn pid(&self) -> u32 {
        u32::try_from(self.pid).unwrap_or(0)
    }
}

/// 创建虚拟机 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateVmDto {
    #[validate(length(min = 1, max = 32))]
    pub name: String,
    pub description: Option<String>,
    #[validate]
    pub config: UpdateVmConfigDto,
}

/// 虚拟机响应 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct VmResponse {
    pub id: String,
    pub name: String,
    pub status: String,
    pub pid: i64,
    pub description: Option<String>,
    pub config: Option<VmConfigResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl VmResponse {
    pub fn new(vm: Model, config: Option<super::vm_config::Model>) -> Self {
        Self {
            id: vm.id,
            name: vm.name,
            status: vm.status,
            pid: vm.pid,
            description: vm.description,
            config: config.map(VmConfigResponse::from),
            created_at: vm.created_at.to_rfc3339(),
            updated_at: vm.updated_at.to_rfc3339(),
        }
    }
}
