/// 虚拟网卡数据模型

use common::NicDevType;
use host::SwitchEngine;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_nics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub name: String,
    pub mac: String,
    pub dev_type: String,  // TAP, VMNET, NETGRAPH
    pub emulation: String, // virtio-net, e1000
    pub switch_id: Option<String>,
    pub vm_id: Option<String>,

    // 限速（bit/s）
    pub rate_limit: bool,
    pub rate_in: i64,
    pub rate_out: i64,

    // 运行时状态：tapN / vmnetN，或 netgraph 的 "bnetN,linkM"
    pub net_dev: Option<String>,
    pub rate_epair: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::switch::Entity",
        from = "Column::SwitchId",
        to = "super::switch::Column::Id"
    )]
    Switch,
}

impl Related<super::switch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Switch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn device_type(&self) -> common::Result<NicDevType> {
        self.dev_type.parse()
    }
}

/// 创建网卡 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateNicDto {
    #[validate(length(min = 1, max = 32))]
    pub name: String,
    /// MAC 地址，"AUTO" 或留空时自动生成
    pub mac: Option<String>,
    pub dev_type: String,
    pub emulation: Option<String>,
    pub switch_id: Option<String>,
    #[serde(default)]
    pub rate_limit: bool,
    #[validate(range(min = 0))]
    pub rate_in: Option<i64>,
    #[validate(range(min = 0))]
    pub rate_out: Option<i64>,
}

/// 克隆网卡 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CloneNicDto {
    #[validate(length(min = 1, max = 32))]
    pub name: String,
}

/// 连接交换机 DTO，switch_id 为空表示断开
#[derive(Debug, Serialize, Deserialize)]
pub struct AttachSwitchDto {
    pub switch_id: Option<String>,
}

/// 挂载到虚拟机 DTO，vm_id 为空表示卸载
#[derive(Debug, Serialize, Deserialize)]
pub struct AttachVmDto {
    pub vm_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NicResponse {
    pub id: String,
    pub name: String,
    pub mac: String,
    pub dev_type: String,
    pub emulation: String,
    pub switch_id: Option<String>,
    pub vm_id: Option<String>,
    /// 实际是否启用限速（netgraph 设备始终为 false）
    pub rate_limit: bool,
    pub rate_in: i64,
    pub rate_out: i64,
    pub net_dev: Option<String>,
    pub created_at: String,
}

impl From<Model> for NicResponse {
    fn from(nic: Model) -> Self {
        let rate_limit = nic
            .device_type()
            .map(|t| SwitchEngine::rate_limit_enabled(t, nic.rate_limit))
            .unwrap_or(false);
        Self {
            id: nic.id,
            name: nic.name,
            mac: nic.mac,
            dev_type: nic.dev_type,
            emulation: nic.emulation,
            switch_id: nic.switch_id,
            vm_id: nic.vm_id,
            rate_limit,
            rate_in: nic.rate_in,
            rate_out: nic.rate_out,
            net_dev: nic.net_dev,
            created_at: nic.created_at.to_rfc3339(),
        }
    }
}
