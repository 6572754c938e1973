/// 请求处理器
///
/// 按固定间隔轮询请求表，每次领取一条最早的未开始请求并在独立任务中执行。
/// 请求入队时已保证同一目标最多一条未完成请求，因此不同目标的请求可以并行执行。
/// 执行过程中的 panic 被隔离在子任务中，请求会被标记为失败

use common::{Error, RequestKind, Result};
use futures::future::join_all;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app_state::AppState;
use crate::db::models::request::Model as RequestModel;
use crate::services::{DiskService, NicService, RequestService, VmService};

pub struct RequestProcessor {
    state: AppState,
}

impl RequestProcessor {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 运行轮询循环，直到收到取消信号；退出前等待执行中的请求完成
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.state.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();

        info!("✅ 请求处理器已启动");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    in_flight.retain(|h| !h.is_finished());
                    // 一次把积压的请求都领完
                    while let Some(handle) = self.poll_once().await {
                        in_flight.push(handle);
                    }
                }
            }
        }

        info!("请求处理器停止，等待 {} 个执行中的请求", in_flight.len());
        join_all(in_flight).await;
    }

    /// 领取并派发一条请求；没有可领取的请求时返回 None
    pub async fn poll_once(&self) -> Option<JoinHandle<()>> {
        let requests = RequestService::new(self.state.clone());
        let request = match requests.claim_next().await {
            Ok(Some(request)) => request,
            Ok(None) => return None,
            Err(e) => {
                error!("领取请求失败: {}", e);
                return None;
            }
        };

        info!(
            "领取请求 {} ({} → {})",
            request.id, request.kind, request.target_id
        );
        let state = self.state.clone();
        Some(tokio::spawn(dispatch(state, request)))
    }
}

async fn dispatch(state: AppState, request: RequestModel) {
    let request_id = request.id.clone();
    let outcome = isolated(execute(state.clone(), request)).await;

    if let Err(e) = RequestService::new(state).finish(&request_id, &outcome).await {
        error!("记录请求 {} 结果失败: {}", request_id, e);
    }
}

/// 在独立任务中运行，panic 转换为内部错误
async fn isolated<F>(work: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match tokio::spawn(work).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(Error::Internal("请求执行过程中发生 panic".to_string())),
        Err(e) => Err(Error::Internal(format!("请求执行被中止: {}", e))),
    }
}

async fn execute(state: AppState, request: RequestModel) -> Result<()> {
    let kind: RequestKind = request.kind.parse()?;
    let target = request.target_id.as_str();

    match kind {
        RequestKind::VmStart => VmService::new(state).start(target).await,
        RequestKind::VmStop => VmService::new(state).stop(target).await,
        RequestKind::VmDelete => VmService::new(state).delete(target, &request.id).await,
        RequestKind::NicClone => NicService::new(state).clone_nic(target, &request.payload).await,
        RequestKind::DiskWipe => DiskService::new(state).wipe(target).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::{test_state, test_state_with};
    use crate::db::models::nic::CreateNicDto;
    use crate::db::models::switch::CreateSwitchDto;
    use crate::services::vm_service::tests::vm_dto;
    use crate::services::SwitchService;
    use host::hypervisor::supervisor::ProcessSpec;
    use host::hypervisor::{FixedLaunch, LaunchBuilder, VmLaunchSpec};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    async fn drain(processor: &RequestProcessor) {
        while let Some(handle) = processor.poll_once().await {
            handle.await.unwrap();
        }
    }

    async fn wait_complete(state: &AppState, request_id: &str) -> bool {
        let requests = RequestService::new(state.clone());
        for _ in 0..100 {
            let status = requests.get_status(request_id).await.unwrap();
            if status.complete {
                return status.successful;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("请求 {} 未完成", request_id);
    }

    async fn explode() -> Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_failure() {
        let outcome = isolated(explode()).await;
        assert!(matches!(outcome, Err(Error::Internal(_))));

        let outcome = isolated(async { Err::<(), _>(Error::NotFound("x".to_string())) }).await;
        assert!(matches!(outcome, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_request_is_recorded() {
        let (state, _kernel) = test_state().await;
        let requests = RequestService::new(state.clone());
        // 目标虚拟机不存在
        let target = common::utils::generate_id();
        let request_id = requests
            .enqueue(RequestKind::VmStart, &target, json!({}))
            .await
            .unwrap();

        drain(&RequestProcessor::new(state.clone())).await;

        let request = requests.get_request(&request_id).await.unwrap();
        assert!(request.complete);
        assert!(!request.successful);
        assert!(request.error_message.unwrap().contains(&target));
        // 目标可以再次接受请求
        assert!(!requests.has_pending(&target, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_end_to_end_lifecycle() {
        let (state, kernel) = test_state().await;
        let processor = RequestProcessor::new(state.clone());
        let vms = VmService::new(state.clone());
        let switches = SwitchService::new(state.clone());
        let nics = NicService::new(state.clone());

        let switch = switches
            .create_switch(CreateSwitchDto {
                name: "bridge0".to_string(),
                switch_type: "IF".to_string(),
                uplink: None,
                description: None,
            })
            .await
            .unwrap();
        switches
            .set_uplink(&switch.id, crate::db::models::switch::SetUplinkDto { uplink: "em0".to_string() })
            .await
            .unwrap();

        let vm = vms.create_vm(vm_dto("web")).await.unwrap();
        let nic = nics
            .create_nic(CreateNicDto {
                name: "web-net0".to_string(),
                mac: None,
                dev_type: "TAP".to_string(),
                emulation: None,
                switch_id: Some(switch.id.clone()),
                rate_limit: false,
                rate_in: None,
                rate_out: None,
            })
            .await
            .unwrap();
        nics.attach_vm(&nic.id, Some(vm.id.clone())).await.unwrap();

        // 启动
        let start = vms.request_start(&vm.id).await.unwrap();
        // 同一目标的第二条请求被拒绝
        assert!(matches!(vms.request_start(&vm.id).await, Err(Error::Conflict(_))));
        drain(&processor).await;
        assert!(wait_complete(&state, &start).await);
        assert_eq!(vms.get_vm(&vm.id).await.unwrap().status, "running");
        assert_eq!(kernel.bridge_members("bridge0"), vec!["em0", "tap0"]);

        // 停止
        let stop = vms.request_stop(&vm.id).await.unwrap();
        drain(&processor).await;
        assert!(wait_complete(&state, &stop).await);
        let stopped = vms.get_vm(&vm.id).await.unwrap();
        assert_eq!(stopped.status, "stopped");
        assert_eq!(stopped.pid, 0);
        assert!(!kernel.has_interface("tap0"));

        // 删除虚拟机，网卡保留后交换机仍被引用
        let delete = vms.request_delete(&vm.id).await.unwrap();
        drain(&processor).await;
        assert!(wait_complete(&state, &delete).await);
        assert!(matches!(vms.get_vm(&vm.id).await, Err(Error::NotFound(_))));
        assert!(matches!(switches.destroy_switch(&switch.id).await, Err(Error::Conflict(_))));

        nics.delete_nic(&nic.id).await.unwrap();
        switches.destroy_switch(&switch.id).await.unwrap();
        assert!(!kernel.has_interface("bridge0"));
        assert!(kernel.has_interface("em0"));
    }

    #[tokio::test]
    async fn test_nic_clone_request() {
        let (state, _kernel) = test_state().await;
        let nics = NicService::new(state.clone());
        let nic = nics
            .create_nic(CreateNicDto {
                name: "net0".to_string(),
                mac: None,
                dev_type: "TAP".to_string(),
                emulation: Some("e1000".to_string()),
                switch_id: None,
                rate_limit: false,
                rate_in: None,
                rate_out: None,
            })
            .await
            .unwrap();

        let request_id = nics
            .request_clone(&nic.id, crate::db::models::nic::CloneNicDto { name: "net1".to_string() })
            .await
            .unwrap();
        drain(&RequestProcessor::new(state.clone())).await;
        assert!(wait_complete(&state, &request_id).await);

        let all = nics.list_nics(None).await.unwrap();
        let clone = all.iter().find(|n| n.name == "net1").unwrap();
        assert_eq!(clone.emulation, "e1000");
        assert!(clone.vm_id.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (state, _kernel) = test_state().await;
        let token = CancellationToken::new();
        let task = tokio::spawn(RequestProcessor::new(state).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    /// vmm 设备始终无法销毁的启动器
    struct StuckVmm;

    #[async_trait::async_trait]
    impl LaunchBuilder for StuckVmm {
        fn build(&self, spec: &VmLaunchSpec) -> Result<ProcessSpec> {
            FixedLaunch::sleep().build(spec)
        }

        async fn release(&self, vm_name: &str) -> Result<()> {
            Err(Error::Hypervisor(format!("/dev/vmm/{} busy", vm_name)))
        }
    }

    #[tokio::test]
    async fn test_failed_stop_still_reaches_stopped() {
        let (state, _kernel) = test_state_with(Arc::new(StuckVmm)).await;
        let processor = RequestProcessor::new(state.clone());
        let vms = VmService::new(state.clone());
        let requests = RequestService::new(state.clone());

        let vm = vms.create_vm(vm_dto("web")).await.unwrap();
        vms.start(&vm.id).await.unwrap();
        let pid = vms.get_vm(&vm.id).await.unwrap().pid;

        let stop = vms.request_stop(&vm.id).await.unwrap();
        drain(&processor).await;
        assert!(!wait_complete(&state, &stop).await);
        let request = requests.get_request(&stop).await.unwrap();
        assert!(request.error_message.unwrap().contains("busy"));

        let stopped = vms.get_vm(&vm.id).await.unwrap();
        assert_eq!(stopped.status, "stopped");
        assert_eq!(stopped.pid, 0);
        assert!(!host::hypervisor::process::is_alive(u32::try_from(pid).unwrap()));
        assert!(!state.supervisors.is_active(&vm.id).await);

        // 可以再次提交启动请求
        assert!(vms.request_start(&vm.id).await.is_ok());
    }
}

