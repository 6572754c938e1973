/// 磁盘数据模型

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "disks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub emulation: String, // nvme, ahci-hd, virtio-blk
    pub vm_id: Option<String>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// 创建磁盘 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateDiskDto {
    #[validate(length(min = 1, max = 32))]
    pub name: String,
    #[validate(length(min = 2, max = 1024))]
    pub path: String,
    #[validate(range(min = 1))]
    pub size_bytes: i64,
    pub emulation: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DiskResponse {
    pub id: String,
    pub name: String,
    pub path: String,
    pub size_bytes: i64,
    pub emulation: String,
    pub vm_id: Option<String>,
    pub created_at: String,
}

impl From<Model> for DiskResponse {
    fn from(disk: Model) -> Self {
        Self {
            id: disk.id,
            name: disk.name,
            path: disk.path,
            size_bytes: disk.size_bytes,
            emulation: disk.emulation,
            vm_id: disk.vm_id,
            created_at: disk.created_at.to_rfc3339(),
        }
    }
}
