/// Easy VM - 宿主机层
///
/// 负责所有与宿主机内核和操作系统进程交互的操作：
/// - 外部命令执行（ifconfig / ngctl / bhyvectl / rctl）
/// - 虚拟交换机引擎（if_bridge 与 netgraph 双后端）
/// - bhyve 进程监管

pub mod command;
pub mod hypervisor;
pub mod network;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use hypervisor::{
    BhyveLaunch, LaunchBuilder, ProcessEvent, ProcessSpec, ResourceLimits, StopOutcome,
    SupervisorHandle, SupervisorRegistry, VmLaunchSpec,
};
pub use network::{RateLimitLink, SwitchBackend, SwitchEngine};
