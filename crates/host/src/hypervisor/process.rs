/// 操作系统进程工具
///
/// 通过 pid 检查和结束进程，用于启动对账时处理上一次运行遗留的 bhyve 进程

use std::time::{Duration, Instant};
use tracing::warn;

use crate::hypervisor::supervisor::StopOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 合法的目标 pid；0 和超出 pid_t 范围的值会被信号发送到整个进程组，必须排除
fn target(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// 进程是否存在
pub fn is_alive(pid: u32) -> bool {
    match target(pid) {
        Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
        None => false,
    }
}

/// 发送 SIGTERM
pub fn terminate(pid: u32) -> bool {
    match target(pid) {
        Some(pid) => unsafe { libc::kill(pid, libc::SIGTERM) == 0 },
        None => false,
    }
}

/// 发送 SIGKILL
pub fn kill(pid: u32) -> bool {
    match target(pid) {
        Some(pid) => unsafe { libc::kill(pid, libc::SIGKILL) == 0 },
        None => false,
    }
}

/// 停止一个不受监管的进程：先 SIGTERM，超时后 SIGKILL
pub async fn stop_pid(pid: u32, timeout: Duration) -> StopOutcome {
    if !is_alive(pid) {
        return StopOutcome::AlreadyExited;
    }
    terminate(pid);

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return StopOutcome::Graceful;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    warn!("进程 {} 在 {:?} 内未退出，发送 SIGKILL", pid, timeout);
    kill(pid);
    StopOutcome::Forced
}
