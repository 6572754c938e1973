/// 启动对账
///
/// 守护进程启动时、请求处理器开始工作前运行一次，修复上一次非正常退出留下的状态：
/// 1. 结束遗留的 bhyve 进程并释放 vmm 设备
/// 2. 拆除所有虚拟机网络，虚拟机一律回到 STOPPED
/// 3. 销毁数据库中记录的所有交换机
/// 4. 销毁带守护进程组标签、但已无人认领的接口
/// 5. 把未完成的请求标记为失败
///
/// 每一步失败只记录日志，不影响后续步骤。连续运行两次时第二次不会产生任何变更

use common::{Result, VmStatus};
use host::hypervisor::process;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::vm::{Column as VmColumn, Entity as VmEntity};
use crate::services::{NicService, RequestService, SwitchService, VmService};

const INTERRUPTED: &str = "守护进程重启，请求被中断";

pub struct Reconciler {
    state: AppState,
}

impl Reconciler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(&self) {
        info!("🔧 开始启动对账");

        if let Err(e) = self.reap_processes().await {
            error!("清理遗留进程失败: {}", e);
        }
        if let Err(e) = self.reset_networking().await {
            error!("拆除虚拟机网络失败: {}", e);
        }
        match SwitchService::new(self.state.clone()).teardown_all().await {
            Ok(n) => info!("已清理 {} 个交换机", n),
            Err(e) => error!("清理交换机失败: {}", e),
        }
        if let Err(e) = self.destroy_leaked_interfaces().await {
            error!("清理遗留接口失败: {}", e);
        }
        match RequestService::new(self.state.clone()).fail_incomplete(INTERRUPTED).await {
            Ok(0) => {}
            Ok(n) => warn!("{} 条未完成请求已标记为失败", n),
            Err(e) => error!("标记未完成请求失败: {}", e),
        }

        info!("✅ 启动对账完成");
    }

    /// 第 1 步：结束记录了 pid 的虚拟机进程
    async fn reap_processes(&self) -> Result<()> {
        let vms = VmEntity::find()
            .filter(VmColumn::Pid.ne(0))
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        let controller = VmService::new(self.state.clone());

        for vm in vms {
            let pid = vm.pid();
            if process::is_alive(pid) {
                warn!("结束虚拟机 {} 遗留的进程 {}", vm.name, pid);
                process::kill(pid);
            }
            if let Err(e) = self.state.launcher.release(&vm.name).await {
                warn!("释放虚拟机 {} 的 vmm 设备失败: {}", vm.name, e);
            }
            if let Err(e) = controller.force_stopped(&vm.id).await {
                error!("重置虚拟机 {} 状态失败: {}", vm.name, e);
            }
        }
        Ok(())
    }

    /// 第 2 步：拆除网卡运行时状态，其余非 STOPPED 虚拟机一并重置
    async fn reset_networking(&self) -> Result<()> {
        let torn_down = NicService::new(self.state.clone()).net_cleanup_all().await?;
        if torn_down > 0 {
            info!("拆除了 {} 张网卡的宿主机网络", torn_down);
        }

        let vms = VmEntity::find()
            .filter(VmColumn::Status.ne(VmStatus::Stopped.as_str()))
            .all(&self.state.sea_db)
            .await
            .map_err(db_err)?;
        let controller = VmService::new(self.state.clone());
        for vm in vms {
            if let Err(e) = controller.force_stopped(&vm.id).await {
                error!("重置虚拟机 {} 状态失败: {}", vm.name, e);
            }
        }
        Ok(())
    }

    /// 第 4 步：销毁剩余的带标签接口
    async fn destroy_leaked_interfaces(&self) -> Result<()> {
        let engine = &self.state.engine;
        let tagged = engine.tagged_interfaces().await?;

        for ifname in &tagged {
            // 销毁 epairNa 时 epairNb 随之消失
            if let Some(base) = ifname.strip_suffix('b').filter(|b| b.starts_with("epair")) {
                if tagged.iter().any(|other| *other == format!("{}a", base)) {
                    continue;
                }
            }
            match engine.destroy_interface(ifname).await {
                Ok(()) => warn!("销毁遗留接口: {}", ifname),
                Err(e) => error!("销毁遗留接口 {} 失败: {}", ifname, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::test_state;
    use crate::db::models::nic::CreateNicDto;
    use crate::db::models::switch::CreateSwitchDto;
    use crate::db::models::vm::ActiveModel as VmActiveModel;
    use crate::services::vm_service::tests::vm_dto;
    use common::RequestKind;
    use host::network::fake::FakeKernel;
    use std::sync::Arc;
    use tokio::process::Child;
    use sea_orm::{ActiveModelTrait, Set};
    use serde_json::json;

    /// 模拟一次崩溃：虚拟机处于 RUNNING 且进程存活，网卡设备、交换机、请求都留在原处
    async fn crashed_state() -> (AppState, Arc<FakeKernel>, String, Child) {
        let (state, kernel) = test_state().await;
        let switches = SwitchService::new(state.clone());
        let bridge = switches
            .create_switch(CreateSwitchDto {
                name: "bridge0".to_string(),
                switch_type: "IF".to_string(),
                uplink: Some("em0".to_string()),
                description: None,
            })
            .await
            .unwrap();
        switches
            .create_switch(CreateSwitchDto {
                name: "bnet0".to_string(),
                switch_type: "NG".to_string(),
                uplink: None,
                description: None,
            })
            .await
            .unwrap();

        let vm = VmService::new(state.clone()).create_vm(vm_dto("web")).await.unwrap();
        let nics = NicService::new(state.clone());
        let dto = CreateNicDto {
            name: "net0".to_string(),
            mac: None,
            dev_type: "TAP".to_string(),
            emulation: None,
            switch_id: Some(bridge.id),
            rate_limit: true,
            rate_in: Some(1_000_000),
            rate_out: Some(1_000_000),
        };
        let nic = nics.create_nic(dto).await.unwrap();
        nics.attach_vm(&nic.id, Some(vm.id.clone())).await.unwrap();
        nics.net_startup(&vm.id, "web").await.unwrap();

        // 未被任何交换机认领的带标签接口
        state
            .engine
            .create_nic_device(common::NicDevType::Vmnet, "leaked")
            .await
            .unwrap();

        let child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let mut active: VmActiveModel = VmEntity::find_by_id(vm.id.clone())
            .one(&state.sea_db)
            .await
            .unwrap()
            .unwrap()
            .into();
        active.status = Set("running".to_string());
        active.pid = Set(i64::from(pid));
        active.update(&state.sea_db).await.unwrap();

        RequestService::new(state.clone())
            .enqueue(RequestKind::VmStop, &vm.id, json!({}))
            .await
            .unwrap();

        (state, kernel, vm.id, child)
    }

    #[tokio::test]
    async fn test_recovers_from_crash() {
        let (state, kernel, vm_id, mut child) = crashed_state().await;
        assert!(kernel.has_interface("tap0"));
        assert!(kernel.has_interface("vmnet0"));

        Reconciler::new(state.clone()).run().await;

        // 进程被结束
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());

        let vm = VmService::new(state.clone()).get_vm(&vm_id).await.unwrap();
        assert_eq!(vm.status, "stopped");
        assert_eq!(vm.pid, 0);

        for ifname in ["tap0", "vmnet0", "epair32767a", "epair32767b", "bridge0"] {
            assert!(!kernel.has_interface(ifname), "{} 未被清理", ifname);
        }
        assert!(!kernel.ng_node_exists("bnet0"));
        assert!(kernel.has_interface("em0"));

        let requests = RequestService::new(state.clone()).list_for_target(&vm_id).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].complete);
        assert!(!requests[0].successful);

        let nics = NicService::new(state).list_nics(Some(&vm_id)).await.unwrap();
        assert!(nics.iter().all(|n| n.net_dev.is_none()));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let (state, kernel, vm_id, mut child) = crashed_state().await;
        let reconciler = Reconciler::new(state.clone());

        reconciler.run().await;
        let _ = child.wait().await;
        let updated_at = VmService::new(state.clone()).get_vm(&vm_id).await.unwrap().updated_at;

        kernel.clear_commands();
        reconciler.run().await;

        assert!(kernel.mutating_commands().is_empty(), "{:?}", kernel.mutating_commands());
        let vm = VmService::new(state).get_vm(&vm_id).await.unwrap();
        assert_eq!(vm.updated_at, updated_at);
    }

    #[tokio::test]
    async fn test_reconcile_then_bring_up() {
        let (state, kernel, _vm_id, mut child) = crashed_state().await;
        Reconciler::new(state.clone()).run().await;
        let _ = child.wait().await;

        let ready = SwitchService::new(state).bring_up_all().await.unwrap();
        assert_eq!(ready, 2);
        assert_eq!(kernel.bridge_members("bridge0"), vec!["em0"]);
        assert!(kernel.ng_node_exists("bnet0"));
    }
}
