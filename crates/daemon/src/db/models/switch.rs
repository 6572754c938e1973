/// 虚拟交换机数据模型

use common::SwitchType;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "switches")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub name: String,
    #[sea_orm(column_name = "type")]
    pub switch_type: String, // IF, NG
    /// 上联接口，没有时为空字符串
    pub uplink: String,
    pub description: Option<String>,

    // 时间戳
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::nic::Entity")]
    Nics,
}

impl Related<super::nic::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Nics.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn kind(&self) -> common::Result<SwitchType> {
        self.switch_type.parse()
    }

    pub fn uplink(&self) -> Option<&str> {
        Some(self.uplink.as_str()).filter(|u| !u.is_empty())
    }
}

/// 创建交换机 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateSwitchDto {
    #[validate(length(min = 1, max = 15))]
    pub name: String,
    pub switch_type: String,
    pub uplink: Option<String>,
    pub description: Option<String>,
}

/// 设置上联 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SetUplinkDto {
    #[validate(length(min = 1, max = 15))]
    pub uplink: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchResponse {
    pub id: String,
    pub name: String,
    pub switch_type: String,
    pub uplink: Option<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Model> for SwitchResponse {
    fn from(switch: Model) -> Self {
        let uplink = switch.uplink().map(str::to_string);
        Self {
            id: switch.id,
            name: switch.name,
            switch_type: switch.switch_type,
            uplink,
            description: switch.description,
            created_at: switch.created_at.to_rfc3339(),
            updated_at: switch.updated_at.to_rfc3339(),
        }
    }
}
