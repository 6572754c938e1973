/// 应用全局状态

use host::hypervisor::{EventSender, LaunchBuilder, ProcessEvent, SupervisorRegistry};
use host::{CommandRunner, SwitchEngine};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;

/// 进程事件接收端，由虚拟机控制器的事件循环消费
pub type EventReceiver = mpsc::UnboundedReceiver<(String, ProcessEvent)>;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// SeaORM 数据库连接
    pub sea_db: DatabaseConnection,
    pub config: Arc<Config>,
    /// 内核命令执行器
    pub runner: Arc<dyn CommandRunner>,
    /// 交换机引擎
    pub engine: SwitchEngine,
    /// 所有交换机变更操作共用的锁
    pub switch_lock: Arc<Mutex<()>>,
    /// bhyve 启动命令构建器
    pub launcher: Arc<dyn LaunchBuilder>,
    /// 运行中虚拟机的监管任务，只由虚拟机控制器读写
    pub supervisors: SupervisorRegistry,
    pub events: EventSender,
}

impl AppState {
    pub fn new(
        sea_db: DatabaseConnection,
        config: Config,
        runner: Arc<dyn CommandRunner>,
        launcher: Arc<dyn LaunchBuilder>,
    ) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let engine = SwitchEngine::new(runner.clone(), config.interface_group.clone());
        let state = Self {
            sea_db,
            config: Arc::new(config),
            runner,
            engine,
            switch_lock: Arc::new(Mutex::new(())),
            launcher,
            supervisors: SupervisorRegistry::new(),
            events,
        };
        (state, receiver)
    }
}

/// 测试用状态：内存数据库、假内核、sleep 进程代替 bhyve，并启动事件循环
#[cfg(test)]
pub async fn test_state() -> (AppState, Arc<host::network::fake::FakeKernel>) {
    test_state_with(Arc::new(host::hypervisor::FixedLaunch::sleep())).await
}

#[cfg(test)]
pub async fn test_state_with(
    launcher: Arc<dyn LaunchBuilder>,
) -> (AppState, Arc<host::network::fake::FakeKernel>) {
    use host::network::fake::FakeKernel;

    let kernel = Arc::new(FakeKernel::new());
    let config = Config {
        stop_timeout_secs: 5,
        ..Config::default()
    };
    let db = crate::db::memory_connection().await;
    let (state, events) = AppState::new(db, config, kernel.clone(), launcher);
    crate::services::vm_service::spawn_event_loop(state.clone(), events);
    (state, kernel)
}
