/// 虚拟网卡服务
///
/// 除网卡记录的增删改查外，还负责虚拟机启动 / 停止时的宿主机侧网络：
/// - TAP / VMNET：创建新的 tapN / vmnetN 并加入交换机，需要限速时经 epair + ng_pipe 接入
/// - NETGRAPH：在 bnetN 上分配一个空闲钩子，由 bhyve 进程自行连接

use chrono::Utc;
use common::utils::{generate_id, generate_mac_address, validate_mac_address, validate_resource_name};
use common::{Error, NicDevType, NicEmulation, Result, SwitchType, VmStatus};
use host::hypervisor::{LaunchNic, NicAttachment};
use host::{RateLimitLink, SwitchEngine};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use tracing::{info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::nic::{
    ActiveModel as NicActiveModel, CloneNicDto, Column as NicColumn, CreateNicDto,
    Entity as NicEntity, Model as NicModel, NicResponse,
};
use crate::db::models::switch::{Entity as SwitchEntity, Model as SwitchModel};
use crate::db::models::vm::Entity as VmEntity;
use crate::services::request_service::RequestService;
use common::RequestKind;

pub struct NicService {
    state: AppState,
}

impl NicService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 创建网卡记录
    pub async fn create_nic(&self, dto: CreateNicDto) -> Result<NicResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        validate_resource_name(&dto.name)?;

        let dev_type: NicDevType = dto.dev_type.parse()?;
        let emulation = match dto.emulation.as_deref() {
            Some(e) => e.parse()?,
            None => NicEmulation::VirtioNet,
        };

        let mac = match dto.mac.as_deref() {
            None | Some("") | Some("AUTO") | Some("auto") => generate_mac_address(),
            Some(mac) if validate_mac_address(mac) => mac.to_lowercase(),
            Some(mac) => return Err(Error::InvalidArgument(format!("无效的 MAC 地址: {}", mac))),
        };

        self.ensure_name_free(&dto.name).await?;
        if let Some(switch_id) = &dto.switch_id {
            self.compatible_switch(dev_type, switch_id).await?;
        }

        let now = Utc::now();
        let nic = NicActiveModel {
            id: Set(generate_id()),
            name: Set(dto.name.clone()),
            mac: Set(mac),
            dev_type: Set(dev_type.as_str().to_string()),
            emulation: Set(emulation.as_str().to_string()),
            switch_id: Set(dto.switch_id.clone()),
            vm_id: Set(None),
            rate_limit: Set(dto.rate_limit),
            rate_in: Set(dto.rate_in.unwrap_or(0)),
            rate_out: Set(dto.rate_out.unwrap_or(0)),
            net_dev: Set(None),
            rate_epair: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        let nic = nic.insert(&self.state.sea_db).await.map_err(db_err)?;

        if dto.rate_limit && !dev_type.supports_rate_limit() {
            info!("网卡 {} 为 {} 设备，不启用限速", nic.name, dev_type.as_str());
        }
        info!("创建网卡: {} ({})", nic.name, nic.id);
        Ok(NicResponse::from(nic))
    }

    pub async fn list_nics(&self, vm_id: Option<&str>) -> Result<Vec<NicResponse>> {
        let mut query = NicEntity::find();
        if let Some(vm_id) = vm_id {
            query = query.filter(NicColumn::VmId.eq(vm_id));
        }
        let nics = query
            .order_by_asc(NicColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(nics.into_iter().map(NicResponse::from).collect())
    }

    pub async fn get_nic(&self, id: &str) -> Result<NicResponse> {
        Ok(NicResponse::from(self.load(id).await?))
    }

    pub async fn load(&self, id: &str) -> Result<NicModel> {
        NicEntity::find_by_id(id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("网卡 {} 不存在", id)))
    }

    async fn ensure_name_free(&self, name: &str) -> Result<()> {
        let existing = NicEntity::find()
            .filter(NicColumn::Name.eq(name))
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!("网卡名 {} 已存在", name)));
        }
        Ok(())
    }

    /// TAP / VMNET 只能连接 if_bridge 交换机，NETGRAPH 只能连接 netgraph 交换机
    async fn compatible_switch(&self, dev_type: NicDevType, switch_id: &str) -> Result<SwitchModel> {
        let switch = SwitchEntity::find_by_id(switch_id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("交换机 {} 不存在", switch_id)))?;
        if switch.kind()? != dev_type.switch_type() {
            return Err(Error::InvalidArgument(format!(
                "{} 网卡不能连接 {} 类型的交换机 {}",
                dev_type.as_str(),
                switch.switch_type,
                switch.name
            )));
        }
        Ok(switch)
    }

    /// 网卡所属虚拟机必须处于停止状态
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

    /// 连接或断开交换机
    pub async fn attach_switch(&self, id: &str, switch_id: Option<String>) -> Result<NicResponse> {
        let nic = self.load(id).await?;
        self.require_vm_stopped(nic.vm_id.as_deref()).await?;
        if let Some(switch_id) = &switch_id {
            self.compatible_switch(nic.device_type()?, switch_id).await?;
        }

        let mut active: NicActiveModel = nic.into();
        active.switch_id = Set(switch_id);
        active.updated_at = Set(Utc::now().into());
        let nic = active.update(&self.state.sea_db).await.map_err(db_err)?;
        Ok(NicResponse::from(nic))
    }

    /// 挂载到虚拟机或卸载
    pub async fn attach_vm(&self, id: &str, vm_id: Option<String>) -> Result<NicResponse> {
        let nic = self.load(id).await?;
        self.require_vm_stopped(nic.vm_id.as_deref()).await?;
        self.require_vm_stopped(vm_id.as_deref()).await?;

        let mut active: NicActiveModel = nic.into();
        active.vm_id = Set(vm_id);
        active.updated_at = Set(Utc::now().into());
        let nic = active.update(&self.state.sea_db).await.map_err(db_err)?;
        Ok(NicResponse::from(nic))
    }

    /// 删除网卡记录，已挂载到虚拟机的网卡需先卸载
    pub async fn delete_nic(&self, id: &str) -> Result<()> {
        let nic = self.load(id).await?;
        if let Some(vm_id) = &nic.vm_id {
            return Err(Error::Conflict(format!("网卡 {} 仍挂载在虚拟机 {} 上", nic.name, vm_id)));
        }
        NicEntity::delete_by_id(id)
            .exec(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        info!("删除网卡: {}", nic.name);
        Ok(())
    }

    /// 提交克隆请求
    pub async fn request_clone(&self, id: &str, dto: CloneNicDto) -> Result<String> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        validate_resource_name(&dto.name)?;
        self.load(id).await?;
        self.ensure_name_free(&dto.name).await?;

        RequestService::new(self.state.clone())
            .enqueue(RequestKind::NicClone, id, json!({ "name": dto.name }))
            .await
    }

    /// 克隆网卡：新名称、新 MAC，不挂载到任何虚拟机
    pub async fn clone_nic(&self, id: &str, payload: &JsonValue) -> Result<()> {
        let name = payload
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::InvalidArgument("克隆请求缺少 name".to_string()))?;
        validate_resource_name(name)?;
        self.ensure_name_free(name).await?;

        let source = self.load(id).await?;
        let now = Utc::now();
        let clone = NicActiveModel {
            id: Set(generate_id()),
            name: Set(name.to_string()),
            mac: Set(generate_mac_address()),
            dev_type: Set(source.dev_type),
            emulation: Set(source.emulation),
            switch_id: Set(source.switch_id),
            vm_id: Set(None),
            rate_limit: Set(source.rate_limit),
            rate_in: Set(source.rate_in),
            rate_out: Set(source.rate_out),
            net_dev: Set(None),
            rate_epair: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        let clone = clone.insert(&self.state.sea_db).await.map_err(db_err)?;
        info!("克隆网卡 {} -> {}", source.name, clone.name);
        Ok(())
    }

    // ==================== 宿主机侧网络 ====================

    async fn set_runtime(&self, id: &str, net_dev: Option<String>, rate_epair: Option<String>) -> Result<()> {
        let nic = self.load(id).await?;
        let mut active: NicActiveModel = nic.into();
        active.net_dev = Set(net_dev);
        active.rate_epair = Set(rate_epair);
        active.updated_at = Set(Utc::now().into());
        active.update(&self.state.sea_db).await.map_err(db_err)?;
        Ok(())
    }

    async fn vm_nics(&self, vm_id: &str) -> Result<Vec<NicModel>> {
        NicEntity::find()
            .filter(NicColumn::VmId.eq(vm_id))
            .order_by_asc(NicColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)
    }

    /// 为虚拟机的所有网卡准备宿主机侧网络，返回 bhyve 需要的网卡参数
    ///
    /// 每一步产生的运行时状态都立即持久化，失败时调用方通过 [`Self::net_cleanup`] 回收
    pub async fn net_startup(&self, vm_id: &str, vm_name: &str) -> Result<Vec<LaunchNic>> {
        let engine = &self.state.engine;
        let _lock = self.state.switch_lock.lock().await;

        let mut reserved: HashMap<String, Vec<String>> = HashMap::new();
        let mut launch = Vec::new();

        for nic in self.vm_nics(vm_id).await? {
            let dev_type = nic.device_type()?;
            let emulation: NicEmulation = nic.emulation.parse()?;
            let switch = match &nic.switch_id {
                Some(switch_id) => Some(self.compatible_switch(dev_type, switch_id).await?),
                None => None,
            };

            let attachment = match dev_type {
                NicDevType::Netgraph => {
                    let switch = switch.ok_or_else(|| {
                        Error::InvalidArgument(format!("netgraph 网卡 {} 未连接交换机", nic.name))
                    })?;
                    let taken = reserved.entry(switch.name.clone()).or_default();
                    let link = engine.next_link(&switch.name, SwitchType::Ng, taken).await?;
                    taken.push(link.clone());
                    self.set_runtime(&nic.id, Some(format!("{},{}", switch.name, link)), None)
                        .await?;
                    NicAttachment::Netgraph {
                        switch: switch.name,
                        link,
                    }
                }
                NicDevType::Tap | NicDevType::Vmnet => {
                    let description = format!("easyvm {} {}", vm_name, nic.name);
                    let dev = engine.create_nic_device(dev_type, &description).await?;
                    self.set_runtime(&nic.id, Some(dev.clone()), None).await?;

                    if let Some(switch) = switch {
                        let mut member = dev.clone();
                        if SwitchEngine::rate_limit_enabled(dev_type, nic.rate_limit) {
                            let rate_in = u64::try_from(nic.rate_in).unwrap_or(0);
                            let rate_out = u64::try_from(nic.rate_out).unwrap_or(0);
                            if let Some(link) = engine
                                .attach_rate_limit(dev_type, &dev, rate_in, rate_out)
                                .await?
                            {
                                self.set_runtime(&nic.id, Some(dev.clone()), Some(link.epair.clone()))
                                    .await?;
                                member = link.switch_side();
                            }
                        }
                        engine.attach_member(&switch.name, SwitchType::If, &member).await?;
                    }
                    NicAttachment::Device(dev)
                }
            };

            info!("网卡 {} 已就绪: {:?}", nic.name, attachment);
            launch.push(LaunchNic {
                emulation,
                attachment,
                mac: nic.mac,
            });
        }

        Ok(launch)
    }

    /// 拆除一张网卡的宿主机侧网络，尽力而为
    async fn teardown(&self, nic: &NicModel) {
        let engine = &self.state.engine;

        if let Some(epair) = &nic.rate_epair {
            engine.detach_rate_limit(&RateLimitLink::from_epair(epair)).await;
        }

        let has_interface = nic
            .device_type()
            .map(|t| t.interface_prefix().is_some())
            .unwrap_or(false);
        if let (Some(dev), true) = (&nic.net_dev, has_interface) {
            match engine.destroy_interface(dev).await {
                Ok(()) => info!("销毁网卡设备: {}", dev),
                Err(e) => warn!("销毁网卡设备 {} 失败: {}", dev, e),
            }
        }

        if let Err(e) = self.set_runtime(&nic.id, None, None).await {
            warn!("清除网卡 {} 运行时状态失败: {}", nic.name, e);
        }
    }

    /// 拆除虚拟机所有网卡的宿主机侧网络
    pub async fn net_cleanup(&self, vm_id: &str) {
        let nics = match self.vm_nics(vm_id).await {
            Ok(nics) => nics,
            Err(e) => {
                warn!("读取虚拟机 {} 的网卡失败: {}", vm_id, e);
                return;
            }
        };

        let _lock = self.state.switch_lock.lock().await;
        for nic in nics.iter().filter(|n| n.net_dev.is_some() || n.rate_epair.is_some()) {
            self.teardown(nic).await;
        }
    }

    /// 拆除所有仍记录着运行时状态的网卡，返回处理的数量
    pub async fn net_cleanup_all(&self) -> Result<usize> {
        let nics = NicEntity::find()
            .filter(
                sea_orm::Condition::any()
                    .add(NicColumn::NetDev.is_not_null())
                    .add(NicColumn::RateEpair.is_not_null()),
            )
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;

        let _lock = self.state.switch_lock.lock().await;
        for nic in &nics {
            self.teardown(nic).await;
        }
        Ok(nics.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_state;
    use crate::db::models::switch::CreateSwitchDto;
    use crate::services::switch_service::SwitchService;

    pub(crate) fn nic_dto(name: &str, dev_type: &str, switch_id: Option<String>) -> CreateNicDto {
        CreateNicDto {
            name: name.to_string(),
            mac: None,
            dev_type: dev_type.to_string(),
            emulation: None,
            switch_id,
            rate_limit: false,
            rate_in: None,
            rate_out: None,
        }
    }

    async fn switch(state: &AppState, name: &str, switch_type: &str) -> String {
        SwitchService::new(state.clone())
            .create_switch(CreateSwitchDto {
                name: name.to_string(),
                switch_type: switch_type.to_string(),
                uplink: None,
                description: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_create_nic_generates_mac_and_checks_switch_type() {
        let (state, _kernel) = test_state().await;
        let service = NicService::new(state.clone());
        let bridge = switch(&state, "bridge0", "IF").await;

        let nic = service.create_nic(nic_dto("net0", "TAP", Some(bridge.clone()))).await.unwrap();
        assert!(validate_mac_address(&nic.mac));
        assert_eq!(nic.emulation, "virtio-net");

        let err = service
            .create_nic(nic_dto("net1", "NETGRAPH", Some(bridge)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = service.create_nic(nic_dto("net0", "TAP", None)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let mut bad = nic_dto("net2", "TAP", None);
        bad.mac = Some("zz:zz".to_string());
        assert!(service.create_nic(bad).await.is_err());
    }

    #[tokio::test]
    async fn test_netgraph_nic_never_reports_rate_limit() {
        let (state, _kernel) = test_state().await;
        let bnet = switch(&state, "bnet0", "NG").await;
        let mut dto = nic_dto("ng0", "NETGRAPH", Some(bnet));
        dto.rate_limit = true;
        dto.rate_in = Some(1_000_000);
        let nic = NicService::new(state).create_nic(dto).await.unwrap();
        assert!(!nic.rate_limit);
    }

    #[tokio::test]
    async fn test_clone_nic() {
        let (state, _kernel) = test_state().await;
        let service = NicService::new(state);
        let source = service.create_nic(nic_dto("net0", "VMNET", None)).await.unwrap();

        service.clone_nic(&source.id, &json!({ "name": "net0-copy" })).await.unwrap();
        let nics = service.list_nics(None).await.unwrap();
        assert_eq!(nics.len(), 2);
        let copy = nics.iter().find(|n| n.name == "net0-copy").unwrap();
        assert_ne!(copy.mac, source.mac);
        assert_eq!(copy.dev_type, "VMNET");

        assert!(service.clone_nic(&source.id, &json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_net_startup_and_cleanup() {
        let (state, kernel) = test_state().await;
        let bridge = switch(&state, "bridge0", "IF").await;
        let bnet = switch(&state, "bnet0", "NG").await;
        let service = NicService::new(state.clone());
        let vm_id = generate_id();

        let mut limited = nic_dto("a-limited", "TAP", Some(bridge.clone()));
        limited.rate_limit = true;
        limited.rate_in = Some(10_000_000);
        limited.rate_out = Some(5_000_000);
        let plain = nic_dto("b-plain", "TAP", Some(bridge));
        let ng1 = nic_dto("c-ng", "NETGRAPH", Some(bnet.clone()));
        let ng2 = nic_dto("d-ng", "NETGRAPH", Some(bnet));

        for dto in [limited, plain, ng1, ng2] {
            let nic = service.create_nic(dto).await.unwrap();
            // 直接写入归属关系，避免依赖虚拟机记录
            let mut active: NicActiveModel = service.load(&nic.id).await.unwrap().into();
            active.vm_id = Set(Some(vm_id.clone()));
            active.update(&state.sea_db).await.unwrap();
        }

        let launch = service.net_startup(&vm_id, "web").await.unwrap();
        assert_eq!(launch.len(), 4);
        assert_eq!(launch[0].attachment, NicAttachment::Device("tap0".to_string()));
        assert_eq!(launch[1].attachment, NicAttachment::Device("tap1".to_string()));
        assert_eq!(
            launch[2].attachment,
            NicAttachment::Netgraph { switch: "bnet0".to_string(), link: "link0".to_string() }
        );
        assert_eq!(
            launch[3].attachment,
            NicAttachment::Netgraph { switch: "bnet0".to_string(), link: "link1".to_string() }
        );

        // 限速网卡经 epair 接入，普通网卡直接加入网桥
        assert_eq!(kernel.bridge_members("bridge0"), vec!["epair32767b", "tap1"]);

        service.net_cleanup(&vm_id).await;
        assert!(!kernel.has_interface("tap0"));
        assert!(!kernel.has_interface("tap1"));
        assert!(!kernel.has_interface("epair32767a"));
        assert!(kernel.bridge_members("bridge0").is_empty());
        assert!(service
            .list_nics(Some(&vm_id))
            .await
            .unwrap()
            .iter()
            .all(|n| n.net_dev.is_none()));
    }
}
