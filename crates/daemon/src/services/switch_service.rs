/// 虚拟交换机服务
///
/// 数据库记录与内核对象保持一致：先改内核，成功后再写库；
/// 写库失败时回滚内核操作。所有变更都在 `switch_lock` 下进行

use chrono::Utc;
use common::utils::{generate_id, validate_interface_name};
use common::{Error, Result, SwitchType};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set};
use tracing::{error, info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::nic::{Column as NicColumn, Entity as NicEntity};
use crate::db::models::switch::{
    ActiveModel as SwitchActiveModel, Column as SwitchColumn, CreateSwitchDto,
    Entity as SwitchEntity, Model as SwitchModel, SetUplinkDto, SwitchResponse,
};

pub struct SwitchService {
    state: AppState,
}

impl SwitchService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 创建交换机
    pub async fn create_switch(&self, dto: CreateSwitchDto) -> Result<SwitchResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let switch_type: SwitchType = dto.switch_type.parse()?;
        let uplink = dto.uplink.as_deref().filter(|u| !u.is_empty());

        let _lock = self.state.switch_lock.lock().await;

        let existing = SwitchEntity::find()
            .filter(SwitchColumn::Name.eq(&dto.name))
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!("交换机 {} 已存在", dto.name)));
        }

        self.state
            .engine
            .create_switch(&dto.name, switch_type, uplink)
            .await?;

        let now = Utc::now();
        let switch = SwitchActiveModel {
            id: Set(generate_id()),
            name: Set(dto.name.clone()),
            switch_type: Set(switch_type.as_str().to_string()),
            uplink: Set(uplink.unwrap_or_default().to_string()),
            description: Set(dto.description),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        match switch.insert(&self.state.sea_db).await {
            Ok(switch) => Ok(SwitchResponse::from(switch)),
            Err(e) => {
                error!("保存交换机 {} 失败，销毁内核对象: {}", dto.name, e);
                if let Err(cleanup) = self.state.engine.destroy_switch(&dto.name, switch_type).await {
                    warn!("销毁交换机 {} 失败: {}", dto.name, cleanup);
                }
                Err(db_err(e))
            }
        }
    }

    pub async fn list_switches(&self) -> Result<Vec<SwitchResponse>> {
        let switches = SwitchEntity::find()
            .order_by_asc(SwitchColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(switches.into_iter().map(SwitchResponse::from).collect())
    }

    pub async fn get_switch(&self, id: &str) -> Result<SwitchResponse> {
        Ok(SwitchResponse::from(self.load(id).await?))
    }

    async fn load(&self, id: &str) -> Result<SwitchModel> {
        SwitchEntity::find_by_id(id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("交换机 {} 不存在", id)))
    }

    async fn save_uplink(&self, switch: SwitchModel, uplink: &str) -> Result<SwitchModel> {
        let mut active: SwitchActiveModel = switch.into();
        active.uplink = Set(uplink.to_string());
        active.updated_at = Set(Utc::now().into());
        active.update(&self.state.sea_db).await.map_err(db_err)
    }

    /// 设置上联；已有其他上联时替换
    pub async fn set_uplink(&self, id: &str, dto: SetUplinkDto) -> Result<SwitchResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        validate_interface_name(&dto.uplink)?;

        let _lock = self.state.switch_lock.lock().await;
        let switch = self.load(id).await?;
        let switch_type = switch.kind()?;
        let engine = &self.state.engine;

        if switch.uplink() == Some(dto.uplink.as_str()) {
            // 内核状态可能已丢失，重新设置是幂等的
            engine.set_uplink(&switch.name, switch_type, &dto.uplink).await?;
            return Ok(SwitchResponse::from(switch));
        }

        engine.set_uplink(&switch.name, switch_type, &dto.uplink).await?;
        if let Some(old) = switch.uplink() {
            if let Err(e) = engine.unset_uplink(&switch.name, switch_type, old).await {
                warn!("移除交换机 {} 原上联 {} 失败: {}", switch.name, old, e);
            }
        }

        let name = switch.name.clone();
        let switch = self.save_uplink(switch, &dto.uplink).await?;
        info!("交换机 {} 上联已更新为 {}", name, dto.uplink);
        Ok(SwitchResponse::from(switch))
    }

    /// 取消上联
    pub async fn unset_uplink(&self, id: &str) -> Result<SwitchResponse> {
        let _lock = self.state.switch_lock.lock().await;
        let switch = self.load(id).await?;
        let Some(uplink) = switch.uplink().map(str::to_string) else {
            return Ok(SwitchResponse::from(switch));
        };

        self.state
            .engine
            .unset_uplink(&switch.name, switch.kind()?, &uplink)
            .await?;
        let switch = self.save_uplink(switch, "").await?;
        Ok(SwitchResponse::from(switch))
    }

    /// 销毁交换机；仍有网卡连接时拒绝
    pub async fn destroy_switch(&self, id: &str) -> Result<()> {
        let _lock = self.state.switch_lock.lock().await;
        let switch = self.load(id).await?;

        let attached = NicEntity::find()
            .filter(NicColumn::SwitchId.eq(id))
            .count(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        if attached > 0 {
            return Err(Error::Conflict(format!(
                "交换机 {} 仍有 {} 张网卡连接",
                switch.name, attached
            )));
        }

        self.state
            .engine
            .destroy_switch(&switch.name, switch.kind()?)
            .await?;
        SwitchEntity::delete_by_id(id)
            .exec(&self.state.sea_db)
            .await
            .map_err(db_err)?;

        info!("✅ 交换机 {} 已销毁", switch.name);
        Ok(())
    }

    /// 按数据库记录在内核中重建所有交换机，返回成功的数量
    pub async fn bring_up_all(&self) -> Result<usize> {
        let _lock = self.state.switch_lock.lock().await;
        let switches = SwitchEntity::find()
            .order_by_asc(SwitchColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;

        let engine = &self.state.engine;
        let mut ready = 0;
        for switch in switches {
            let switch_type = match switch.kind() {
                Ok(t) => t,
                Err(e) => {
                    error!("交换机 {} 类型无效: {}", switch.name, e);
                    continue;
                }
            };

            let result = match engine.switch_exists(&switch.name, switch_type).await {
                Ok(true) => match switch.uplink() {
                    Some(uplink) => engine.set_uplink(&switch.name, switch_type, uplink).await,
                    None => Ok(()),
                },
                Ok(false) => engine.create_switch(&switch.name, switch_type, switch.uplink()).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => ready += 1,
                Err(e) => error!("恢复交换机 {} 失败: {}", switch.name, e),
            }
        }
        Ok(ready)
    }

    /// 销毁所有已知交换机的内核对象，保留数据库记录
    pub async fn teardown_all(&self) -> Result<usize> {
        let _lock = self.state.switch_lock.lock().await;
        let switches = SwitchEntity::find()
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;

        let mut destroyed = 0;
        for switch in switches {
            let result = match switch.kind() {
                Ok(t) => self.state.engine.destroy_switch(&switch.name, t).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => destroyed += 1,
                Err(e) => error!("销毁交换机 {} 失败: {}", switch.name, e),
            }
        }
        Ok(destroyed)
    }
}
