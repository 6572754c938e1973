/// bhyve 进程管理
///
/// 启动命令构建、资源限制以及运行中虚拟机进程的监管

pub mod launch;
pub mod limits;
pub mod process;
pub mod registry;
pub mod supervisor;

#[cfg(any(test, feature = "testing"))]
pub use launch::FixedLaunch;
pub use launch::{BhyveLaunch, LaunchBuilder, LaunchDisk, LaunchNic, NicAttachment, VmLaunchSpec};
pub use limits::ResourceLimits;
pub use registry::SupervisorRegistry;
pub use supervisor::{
    spawn, EventSender, ProcessEvent, ProcessSpec, RestartPolicy, StopOutcome, SupervisorHandle,
};
