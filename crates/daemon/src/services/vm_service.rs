/// 虚拟机控制器
///
/// 状态机：STOPPED → STARTING → RUNNING → STOPPING → STOPPED，
/// 另外允许 STARTING / RUNNING 在进程意外退出时直接回到 STOPPED。
///
/// 每台虚拟机的启动流程和进程事件处理在注册表提供的同一把锁下串行执行，
/// 因此监管任务发来的 Started 事件一定在启动流程写完 RUNNING 之后才被处理

use chrono::Utc;
use common::utils::{generate_id, validate_id, validate_resource_name};
use common::{DiskEmulation, Error, RequestKind, Result, VmStatus};
use host::hypervisor::{
    limits, process, spawn, LaunchDisk, LaunchNic, ProcessEvent, StopOutcome, VmLaunchSpec,
};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::json;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use validator::Validate;

use crate::app_state::{AppState, EventReceiver};
use crate::db::db_err;
use crate::db::models::disk::{Column as DiskColumn, Entity as DiskEntity};
use crate::db::models::nic::{Column as NicColumn, Entity as NicEntity};
use crate::db::models::vm::{
    ActiveModel as VmActiveModel, Column as VmColumn, CreateVmDto, Entity as VmEntity,
    Model as VmModel, VmResponse,
};
use crate::db::models::vm_config::{
    self, ActiveModel as VmConfigActiveModel, Entity as VmConfigEntity, Model as VmConfigModel,
    UpdateVmConfigDto,
};
use crate::services::nic_service::NicService;
use crate::services::request_service::RequestService;

pub struct VmService {
    state: AppState,
}

impl VmService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn requests(&self) -> RequestService {
        RequestService::new(self.state.clone())
    }

    fn nics(&self) -> NicService {
        NicService::new(self.state.clone())
    }

    // ==================== 记录管理 ====================

    /// 创建虚拟机（初始状态 STOPPED）
    pub async fn create_vm(&self, dto: CreateVmDto) -> Result<VmResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        validate_resource_name(&dto.name)?;

        let existing = VmEntity::find()
            .filter(VmColumn::Name.eq(&dto.name))
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(format!("虚拟机 {} 已存在", dto.name)));
        }

        let vm_id = generate_id();
        let now = Utc::now();
        let vm = VmActiveModel {
            id: Set(vm_id.clone()),
            name: Set(dto.name.clone()),
            status: Set(VmStatus::Stopped.as_str().to_string()),
            pid: Set(0),
            description: Set(dto.description),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };
        let mut config = vm_config::default_active(&vm_id);
        dto.config.apply(&mut config);

        let txn = self.state.sea_db.begin().await.map_err(db_err)?;
        let vm = vm.insert(&txn).await.map_err(db_err)?;
        let config = config.insert(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;

        info!("✅ 创建虚拟机: {} ({})", vm.name, vm.id);
        Ok(VmResponse::new(vm, Some(config)))
    }

    pub async fn list_vms(&self) -> Result<Vec<VmResponse>> {
        let vms = VmEntity::find()
            .find_also_related(VmConfigEntity)
            .order_by_asc(VmColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(vms
            .into_iter()
            .map(|(vm, config)| VmResponse::new(vm, config))
            .collect())
    }

    pub async fn get_vm(&self, id: &str) -> Result<VmResponse> {
        let vm = self.load(id).await?;
        let config = self.load_config(id).await.ok();
        Ok(VmResponse::new(vm, config))
    }

    async fn load(&self, id: &str) -> Result<VmModel> {
        VmEntity::find_by_id(id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {} 不存在", id)))
    }

    async fn load_config(&self, id: &str) -> Result<VmConfigModel> {
        VmConfigEntity::find_by_id(id)
            .one(&self.state.sea_db)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::NotFound(format!("虚拟机 {} 的配置不存在", id)))
    }

    /// 更新配置，仅允许在 STOPPED 状态下进行
    pub async fn update_config(&self, id: &str, dto: UpdateVmConfigDto) -> Result<VmResponse> {
        dto.validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Stopped, "修改配置")?;

        let mut config: VmConfigActiveModel = self.load_config(id).await?.into();
        dto.apply(&mut config);
        let config = config.update(&self.state.sea_db).await.map_err(db_err)?;

        info!("虚拟机 {} 配置已更新", vm.name);
        Ok(VmResponse::new(vm, Some(config)))
    }

    fn require_status(vm: &VmModel, expected: VmStatus, action: &str) -> Result<()> {
        let current = vm.vm_status()?;
        if current != expected {
            return Err(Error::InvalidState(format!(
                "虚拟机 {} 当前状态为 {}，无法{}",
                vm.name, current, action
            )));
        }
        Ok(())
    }

    // ==================== 请求入口 ====================

    /// 提交启动请求，返回请求 ID
    pub async fn request_start(&self, id: &str) -> Result<String> {
        validate_id(id)?;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Stopped, "启动")?;
        self.requests()
            .enqueue(RequestKind::VmStart, id, json!({}))
            .await
    }

    pub async fn request_stop(&self, id: &str) -> Result<String> {
        validate_id(id)?;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Running, "停止")?;
        self.requests()
            .enqueue(RequestKind::VmStop, id, json!({}))
            .await
    }

    pub async fn request_delete(&self, id: &str) -> Result<String> {
        validate_id(id)?;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Stopped, "删除")?;
        self.requests()
            .enqueue(RequestKind::VmDelete, id, json!({}))
            .await
    }

    // ==================== 状态持久化 ====================

    async fn set_status(&self, id: &str, to: VmStatus, pid: Option<u32>, force: bool) -> Result<()> {
        let vm = self.load(id).await?;
        let from = match vm.vm_status() {
            Ok(from) => from,
            Err(e) if force => {
                warn!("虚拟机 {} 的状态值无法识别，强制覆盖为 {}: {}", vm.name, to, e);
                to
            }
            Err(e) => return Err(e),
        };
        if !force && from != to && !from.can_transition_to(to) {
            return Err(Error::InvalidState(format!(
                "虚拟机 {} 不能从 {} 迁移到 {}",
                vm.name, from, to
            )));
        }

        let name = vm.name.clone();
        let mut active: VmActiveModel = vm.into();
        active.status = Set(to.as_str().to_string());
        if let Some(pid) = pid {
            active.pid = Set(i64::from(pid));
        }
        active.updated_at = Set(Utc::now().into());
        active.update(&self.state.sea_db).await.map_err(db_err)?;

        if from != to {
            info!("虚拟机 {} 状态: {} → {}", name, from, to);
        }
        Ok(())
    }

    async fn transition(&self, id: &str, to: VmStatus, pid: Option<u32>) -> Result<()> {
        self.set_status(id, to, pid, false).await
    }

    /// 无条件回到 STOPPED 并清零 pid
    pub(crate) async fn force_stopped(&self, id: &str) -> Result<()> {
        self.set_status(id, VmStatus::Stopped, Some(0), true).await
    }

    // ==================== 启动 / 停止 / 删除 ====================

    /// 启动虚拟机
    ///
    /// 任一步骤失败都会回收已创建的网络资源并回到 STOPPED
    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.state.supervisors.guard(id).await;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Stopped, "启动")?;
        if self.state.supervisors.is_active(id).await {
            return Err(Error::InvalidState(format!("虚拟机 {} 仍有运行中的进程", vm.name)));
        }

        self.transition(id, VmStatus::Starting, None).await?;

        match self.launch(&vm).await {
            Ok(pid) => {
                self.transition(id, VmStatus::Running, Some(pid)).await?;
                info!("✅ 虚拟机 {} 已启动, pid={}", vm.name, pid);
                Ok(())
            }
            Err(e) => {
                error!("启动虚拟机 {} 失败: {}", vm.name, e);
                self.nics().net_cleanup(id).await;
                if let Err(release) = self.state.launcher.release(&vm.name).await {
                    warn!("释放虚拟机 {} 资源失败: {}", vm.name, release);
                }
                self.force_stopped(id).await?;
                Err(e)
            }
        }
    }

    async fn launch(&self, vm: &VmModel) -> Result<u32> {
        let config = self.load_config(&vm.id).await?;
        let nics = self.nics().net_startup(&vm.id, &vm.name).await?;
        let disks = self.launch_disks(&vm.id).await?;
        let spec = Self::launch_spec(vm, &config, nics, disks);

        let process = self.state.launcher.build(&spec)?;
        let handle = spawn(&vm.id, process, self.state.events.clone())?;
        let pid = handle.pid();
        self.state.supervisors.insert(handle).await?;

        let limits = config.limits();
        if !limits.is_empty() {
            limits::apply(&self.state.runner, pid, &limits).await?;
        }
        Ok(pid)
    }

    async fn launch_disks(&self, vm_id: &str) -> Result<Vec<LaunchDisk>> {
        let disks = DiskEntity::find()
            .filter(DiskColumn::VmId.eq(vm_id))
            .order_by_asc(DiskColumn::Name)
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        disks
            .into_iter()
            .map(|disk| {
                let emulation: DiskEmulation = disk.emulation.parse()?;
                Ok(LaunchDisk {
                    emulation,
                    path: disk.path,
                })
            })
            .collect()
    }

    fn launch_spec(
        vm: &VmModel,
        config: &VmConfigModel,
        nics: Vec<LaunchNic>,
        disks: Vec<LaunchDisk>,
    ) -> VmLaunchSpec {
        VmLaunchSpec {
            name: vm.name.clone(),
            cpus: u32::try_from(config.cpus).unwrap_or(0),
            memory_mb: u64::try_from(config.memory_mb).unwrap_or(0),
            wire_memory: config.wire_memory,
            utc_clock: config.utc_clock,
            acpi: config.acpi,
            yield_on_hlt: config.yield_on_hlt,
            exit_on_pause: config.exit_on_pause,
            com1: config.com1.then(|| format!("/dev/nmdm-{}-A", vm.name)),
            bootrom: config.bootrom.clone(),
            bootrom_vars: config.bootrom_vars.clone(),
            nics,
            disks,
            restart: config.restart,
            restart_delay_secs: u64::try_from(config.restart_delay_secs).unwrap_or(0),
        }
    }

    fn stop_timeout(&self, config: Option<&VmConfigModel>) -> Duration {
        config
            .and_then(|c| c.stop_timeout_secs)
            .and_then(|s| u64::try_from(s).ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.state.config.stop_timeout())
    }

    /// 停止虚拟机：SIGTERM，超时后 SIGKILL
    ///
    /// 无论进程以何种方式结束，最终都会回到 STOPPED
    pub async fn stop(&self, id: &str) -> Result<()> {
        let guard = self.state.supervisors.guard(id).await;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Running, "停止")?;
        let config = self.load_config(id).await.ok();

        self.transition(id, VmStatus::Stopping, None).await?;
        let handle = self.state.supervisors.remove(id).await;
        drop(guard);

        let timeout = self.stop_timeout(config.as_ref());
        let result = match handle {
            Some(handle) => handle.stop(timeout).await,
            None => {
                warn!("虚拟机 {} 没有监管任务，按 pid {} 停止", vm.name, vm.pid());
                Ok(process::stop_pid(vm.pid(), timeout).await)
            }
        };

        match &result {
            Ok(StopOutcome::Forced) => warn!("虚拟机 {} 被强制结束", vm.name),
            Ok(outcome) => info!("虚拟机 {} 进程已结束: {:?}", vm.name, outcome),
            Err(e) => error!("停止虚拟机 {} 失败: {}", vm.name, e),
        }

        let released = self.release(&vm).await;
        self.force_stopped(id).await?;
        result?;
        released
    }

    /// 回收进程退出后遗留的资源
    ///
    /// 每一步都会执行；vmm 设备释放失败时返回错误
    async fn release(&self, vm: &VmModel) -> Result<()> {
        let released = self.state.launcher.release(&vm.name).await;
        if let Err(e) = &released {
            warn!("释放虚拟机 {} 资源失败: {}", vm.name, e);
        }
        if vm.pid() != 0 {
            limits::clear(&self.state.runner, vm.pid()).await;
        }
        self.nics().net_cleanup(&vm.id).await;
        released
    }

    /// 删除虚拟机；网卡和磁盘记录保留，只解除挂载
    pub async fn delete(&self, id: &str, request_id: &str) -> Result<()> {
        let guard = self.state.supervisors.guard(id).await;
        let vm = self.load(id).await?;
        Self::require_status(&vm, VmStatus::Stopped, "删除")?;
        if self.state.supervisors.is_active(id).await {
            return Err(Error::InvalidState(format!("虚拟机 {} 仍有运行中的进程", vm.name)));
        }
        if self.requests().has_pending(id, Some(request_id)).await? {
            return Err(Error::Conflict(format!("虚拟机 {} 还有未完成的请求", vm.name)));
        }

        let txn = self.state.sea_db.begin().await.map_err(db_err)?;
        VmConfigEntity::delete_by_id(id)
            .exec(&txn)
            .await
            .map_err(db_err)?;
        NicEntity::update_many()
            .col_expr(NicColumn::VmId, Option::<String>::None.into())
            .filter(NicColumn::VmId.eq(id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        DiskEntity::update_many()
            .col_expr(DiskColumn::VmId, Option::<String>::None.into())
            .filter(DiskColumn::VmId.eq(id))
            .exec(&txn)
            .await
            .map_err(db_err)?;
        VmEntity::delete_by_id(id).exec(&txn).await.map_err(db_err)?;
        txn.commit().await.map_err(db_err)?;

        drop(guard);
        self.state.supervisors.forget(id).await;
        info!("✅ 虚拟机 {} 已删除", vm.name);
        Ok(())
    }

    /// 守护进程退出前停止所有运行中的虚拟机
    pub async fn shutdown_all(&self) {
        for vm_id in self.state.supervisors.vm_ids().await {
            if let Err(e) = self.stop(&vm_id).await {
                warn!("退出时停止虚拟机 {} 失败: {}", vm_id, e);
            }
        }
    }

    // ==================== 进程事件 ====================

    async fn handle_event(&self, vm_id: &str, event: ProcessEvent) {
        let _guard = self.state.supervisors.guard(vm_id).await;
        let supervised = self.state.supervisors.pid(vm_id).await.is_some();

        let result = match event {
            ProcessEvent::Started { pid } if supervised => self.on_started(vm_id, pid).await,
            ProcessEvent::Exited { requested: true, .. } => Ok(()),
            ProcessEvent::Exited { restarting: true, pid, code, .. } if supervised => {
                info!("虚拟机 {} 进程 {} 退出 ({:?})，等待重启", vm_id, pid, code);
                self.set_status(vm_id, VmStatus::Stopped, Some(0), false).await
            }
            ProcessEvent::Restarting if supervised => {
                self.transition(vm_id, VmStatus::Starting, None).await
            }
            ProcessEvent::Exited { .. } | ProcessEvent::RespawnFailed { .. } => {
                self.on_terminated(vm_id).await
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            error!("处理虚拟机 {} 的进程事件失败: {}", vm_id, e);
        }
    }

    async fn on_started(&self, vm_id: &str, pid: u32) -> Result<()> {
        self.transition(vm_id, VmStatus::Running, Some(pid)).await?;
        // 重启后 pid 变化，资源限制需要重新应用
        if let Ok(config) = self.load_config(vm_id).await {
            let limits = config.limits();
            if !limits.is_empty() {
                limits::apply(&self.state.runner, pid, &limits).await?;
            }
        }
        Ok(())
    }

    /// 进程最终退出（未请求且不再重启）
    async fn on_terminated(&self, vm_id: &str) -> Result<()> {
        if self.state.supervisors.remove(vm_id).await.is_none() {
            return Ok(());
        }
        let vm = self.load(vm_id).await?;
        warn!("虚拟机 {} 进程意外退出", vm.name);
        let released = self.release(&vm).await;
        self.force_stopped(vm_id).await?;
        released
    }
}

/// 消费监管任务发来的进程事件
pub fn spawn_event_loop(state: AppState, mut events: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let service = VmService::new(state);
        while let Some((vm_id, event)) = events.recv().await {
            service.handle_event(&vm_id, event).await;
        }
    })
}
