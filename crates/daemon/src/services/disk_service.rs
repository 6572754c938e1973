/// 磁盘服务

use chrono::Utc;
use common::utils::{generate_id, validate_resource_name};
use common::{DiskEmulation, Error, RequestKind, Result, VmStatus};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::json;
use std::path::Path;
use tracing::info;
use validator::Validate;

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::disk::{
    ActiveModel as DiskActiveModel, Column as DiskColumn, CreateDiskDto, DiskResponse,
    Entity as DiskEntity, Model as DiskModel,
};
use crate::db::models::vm::Entity as VmEntity;
use crate::services::request_service::RequestService;

pub struct DiskService {
    state: AppState,
}

impl DiskService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn create_disk(&self, dto: CreateDiskDto) -> Result<DiskResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        validate_resource_name(&dto.name)?;
        if !Path::new(&dto.path).is_absolute() {
            return Err(Error::InvalidArgument(format!("磁盘路径必须是绝对路径: {}", dto.path)));
        }
        let emulation = match dto.emulation.as_deref() {
            Some(e) => e.parse()?,
            None => DiskEmulation::VirtioBlk,
        };

        let existing = DiskEntity::find()
            .filter(DiskColumn::Name.eq(&dto.name))
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!("磁盘名 {} 已存在", dto.name)));
        }

        let disk = DiskActiveModel {
            id: Set(generate_id()),
            name: Set(dto.name),
            path: Set(dto.path),
            size_bytes: Set(dto.size_bytes),
            emulation: Set(emulation.as_str().to_string()),
            vm_id: Set(None),
            created_at: Set(Utc::now().into()),
        };
        let disk = disk.insert(&self.state.sea_db).await.map_err(db_err)?;
        info!("创建磁盘: {} -> {}", disk.name, disk.path);
        Ok(DiskResponse::from(disk))
    }

    pub async fn list_disks(&self, vm_id: Option<&str>) -> Result<Vec<DiskResponse>> {
        let mut query = DiskEntity::find();
        if let Some(vm_id) = vm_id {
            query = query.filter(DiskColumn::VmId.eq(vm_id));
        }
        let disks = query
            .order_by_asc(DiskColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(disks.into_iter().map(DiskResponse::from).collect())
    }

    pub async fn get_disk(&self, id: &str) -> Result<DiskResponse> {
        Ok(DiskResponse::from(self.load(id).await?))
    }

    async fn load(&self, id: &str) -> Result<DiskModel> {
        DiskEntity::find_by_id(id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("磁盘 {} 不存在", id)))
    }

    async fn require_vm_stopped(&self, vm_id: Option<&str>) -> Result<()> {
        let Some(vm_id) = vm_id else {
            return Ok(());
        };
        let vm = VmEntity::find_by_id(vm_id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {} 不存在", vm_id)))?;
        if vm.vm_status()? != VmStatus::Stopped {
            return Err(Error::InvalidState(format!(
                "虚拟机 {} 当前状态为 {}，需先停止",
                vm.name, vm.status
            )));
        }
        Ok(())
    }

    /// 挂载到虚拟机或卸载
    pub async fn attach_vm(&self, id: &str, vm_id: Option<String>) -> Result<DiskResponse> {
        let disk = self.load(id).await?;
        self.require_vm_stopped(disk.vm_id.as_deref()).await?;
        self.require_vm_stopped(vm_id.as_deref()).await?;

        let mut active: DiskActiveModel = disk.into();
        active.vm_id = Set(vm_id);
        let disk = active.update(&self.state.sea_db).await.map_err(db_err)?;
        Ok(DiskResponse::from(disk))
    }

    /// 提交擦除请求
    pub async fn request_wipe(&self, id: &str) -> Result<String> {
        let disk = self.load(id).await?;
        self.require_vm_stopped(disk.vm_id.as_deref()).await?;
        RequestService::new(self.state.clone())
            .enqueue(RequestKind::DiskWipe, id, json!({}))
            .await
    }

    /// 擦除磁盘：截断为零后重新扩展到配置大小（稀疏文件）
    pub async fn wipe(&self, id: &str) -> Result<()> {
        let disk = self.load(id).await?;
        self.require_vm_stopped(disk.vm_id.as_deref()).await?;

        let size = u64::try_from(disk.size_bytes)
            .map_err(|_| Error::InvalidArgument(format!("磁盘 {} 大小无效", disk.name)))?;
        let storage_err = |e: std::io::Error| Error::Storage(format!("擦除磁盘 {} 失败: {}", disk.path, e));

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&disk.path)
            .await
            .map_err(storage_err)?;
        file.set_len(size).await.map_err(storage_err)?;
        file.sync_all().await.map_err(storage_err)?;

        info!("✅ 磁盘 {} 已擦除 ({} 字节)", disk.name, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_state;

    fn disk_dto(name: &str, path: &str, size_bytes: i64) -> CreateDiskDto {
        CreateDiskDto {
            name: name.to_string(),
            path: path.to_string(),
            size_bytes,
            emulation: None,
        }
    }

    #[tokio::test]
    async fn test_create_disk_validation() {
        let (state, _kernel) = test_state().await;
        let service = DiskService::new(state);

        let disk = service
            .create_disk(disk_dto("root", "/vm/web/root.img", 1 << 30))
            .await
            .unwrap();
        assert_eq!(disk.emulation, "virtio-blk");

        let err = service
            .create_disk(disk_dto("rel", "vm/rel.img", 1024))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = service
            .create_disk(disk_dto("root", "/vm/other.img", 1024))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_wipe_recreates_sparse_file() {
        let (state, _kernel) = test_state().await;
        let service = DiskService::new(state);

        let path = std::env::temp_dir().join(format!("easyvm-wipe-{}.img", generate_id()));
        tokio::fs::write(&path, b"old contents").await.unwrap();

        let disk = service
            .create_disk(disk_dto("scratch", path.to_str().unwrap(), 4096))
            .await
            .unwrap();
        service.wipe(&disk.id).await.unwrap();

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data.iter().all(|b| *b == 0));
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_wipe_missing_directory_is_storage_error() {
        let (state, _kernel) = test_state().await;
        let service = DiskService::new(state);
        let disk = service
            .create_disk(disk_dto("lost", "/nonexistent-dir/lost.img", 4096))
            .await
            .unwrap();
        assert!(matches!(service.wipe(&disk.id).await, Err(Error::Storage(_))));
    }
}
