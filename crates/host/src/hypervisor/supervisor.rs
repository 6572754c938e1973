/// 虚拟机进程监管
///
/// 每个运行中的虚拟机对应一个监管任务，负责：
/// - 持有子进程句柄并跟踪当前 pid
/// - 进程退出后按重启策略重新拉起
/// - 响应停止命令：先 SIGTERM，超时后强制 kill
///
/// 所有生命周期变化都以 [`ProcessEvent`] 的形式发给虚拟机控制器

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::hypervisor::process;

/// 重启策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_secs(1),
        }
    }
}

/// 被监管进程的启动参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub restart: RestartPolicy,
}

/// 进程生命周期事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: u32 },
    Exited {
        pid: u32,
        code: Option<i32>,
        /// 是否由停止命令引起
        requested: bool,
        /// 是否即将按重启策略重新拉起
        restarting: bool,
    },
    Restarting,
    RespawnFailed { error: String },
}

/// 事件通道，携带虚拟机 ID
pub type EventSender = mpsc::UnboundedSender<(String, ProcessEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    Forced,
    AlreadyExited,
}

enum SupervisorCommand {
    Stop {
        timeout: Duration,
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// 监管任务句柄
pub struct SupervisorHandle {
    vm_id: String,
    pid: Arc<AtomicU32>,
    cmd_tx: mpsc::Sender<SupervisorCommand>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// 当前进程 pid；重启后会更新
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    /// 监管任务是否已结束（进程退出且不再重启）
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 停止进程并结束监管
    pub async fn stop(self, timeout: Duration) -> Result<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SupervisorCommand::Stop { timeout, reply })
            .await
            .is_err()
        {
            return Ok(StopOutcome::AlreadyExited);
        }

        let outcome = rx.await.unwrap_or(StopOutcome::AlreadyExited);
        self.task
            .await
            .map_err(|e| Error::Hypervisor(format!("监管任务异常退出: {}", e)))?;
        Ok(outcome)
    }
}

/// 启动进程并开始监管
///
/// 第一次启动是同步的：进程无法拉起时直接返回错误，不会产生任何事件
pub fn spawn(vm_id: &str, spec: ProcessSpec, events: EventSender) -> Result<SupervisorHandle> {
    let child = start_child(&spec)?;
    let pid = child.id().unwrap_or(0);
    info!("虚拟机 {} 进程已启动, pid={}", vm_id, pid);
    let _ = events.send((vm_id.to_string(), ProcessEvent::Started { pid }));

    let pid_cell = Arc::new(AtomicU32::new(pid));
    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    let task = tokio::spawn(supervise(
        vm_id.to_string(),
        spec,
        child,
        pid_cell.clone(),
        cmd_rx,
        events,
    ));

    Ok(SupervisorHandle {
        vm_id: vm_id.to_string(),
        pid: pid_cell,
        cmd_tx,
        task,
    })
}

fn start_child(spec: &ProcessSpec) -> Result<Child> {
    Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Hypervisor(format!("启动进程 {} 失败: {}", spec.program, e)))
}

async fn supervise(
    vm_id: String,
    spec: ProcessSpec,
    mut child: Child,
    pid: Arc<AtomicU32>,
    mut cmd_rx: mpsc::Receiver<SupervisorCommand>,
    events: EventSender,
) {
    let emit = |event: ProcessEvent| {
        let _ = events.send((vm_id.clone(), event));
    };
    // 句柄被丢弃后继续看护进程，但不再接收命令
    let mut detached = false;

    loop {
        let current = pid.load(Ordering::SeqCst);

        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                let restarting = spec.restart.enabled;
                info!("虚拟机 {} 进程 {} 退出, 退出码 {:?}", vm_id, current, code);
                emit(ProcessEvent::Exited { pid: current, code, requested: false, restarting });

                if !restarting {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(spec.restart.delay) => {}
                    cmd = cmd_rx.recv(), if !detached => {
                        if let Some(SupervisorCommand::Stop { reply, .. }) = cmd {
                            let _ = reply.send(StopOutcome::AlreadyExited);
                        }
                        return;
                    }
                }

                emit(ProcessEvent::Restarting);
                match start_child(&spec) {
                    Ok(next) => {
                        child = next;
                        let next_pid = child.id().unwrap_or(0);
                        pid.store(next_pid, Ordering::SeqCst);
                        info!("虚拟机 {} 进程已重启, pid={}", vm_id, next_pid);
                        emit(ProcessEvent::Started { pid: next_pid });
                    }
                    Err(e) => {
                        error!("虚拟机 {} 进程重启失败: {}", vm_id, e);
                        emit(ProcessEvent::RespawnFailed { error: e.to_string() });
                        return;
                    }
                }
            }
            cmd = cmd_rx.recv(), if !detached => {
                match cmd {
                    Some(SupervisorCommand::Stop { timeout, reply }) => {
                        let (outcome, code) = stop_child(&vm_id, &mut child, current, timeout).await;
                        emit(ProcessEvent::Exited { pid: current, code, requested: true, restarting: false });
                        let _ = reply.send(outcome);
                        return;
                    }
                    None => detached = true,
                }
            }
        }
    }
}

async fn stop_child(
    vm_id: &str,
    child: &mut Child,
    pid: u32,
    timeout: Duration,
) -> (StopOutcome, Option<i32>) {
    if let Ok(Some(status)) = child.try_wait() {
        return (StopOutcome::AlreadyExited, status.code());
    }

    info!("停止虚拟机 {} 进程 {} (SIGTERM)", vm_id, pid);
    process::terminate(pid);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (StopOutcome::Graceful, status.ok().and_then(|s| s.code())),
        Err(_) => {
            warn!("虚拟机 {} 进程 {} 在 {:?} 内未退出，强制结束", vm_id, pid, timeout);
            if let Err(e) = child.kill().await {
                error!("强制结束进程 {} 失败: {}", pid, e);
            }
            (StopOutcome::Forced, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], restart: bool) -> ProcessSpec {
        ProcessSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            restart: RestartPolicy {
                enabled: restart,
                delay: Duration::from_millis(50),
            },
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<(String, ProcessEvent)>) -> ProcessEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("等待事件超时")
            .expect("事件通道已关闭")
            .1
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn("vm-1", spec("sleep", &["30"], false), tx).unwrap();
        let pid = handle.pid();
        assert!(pid > 0);
        assert_eq!(next_event(&mut rx).await, ProcessEvent::Started { pid });

        let outcome = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        match next_event(&mut rx).await {
            ProcessEvent::Exited { requested, restarting, .. } => {
                assert!(requested);
                assert!(!restarting);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!process::is_alive(pid));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // 忽略 SIGTERM 的进程
        let handle = spawn(
            "vm-2",
            spec("sh", &["-c", "trap '' TERM; sleep 30"], false),
            tx,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = handle.stop(Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Forced);
    }

    #[tokio::test]
    async fn test_unsolicited_exit_without_restart() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn("vm-3", spec("true", &[], false), tx).unwrap();
        assert!(matches!(next_event(&mut rx).await, ProcessEvent::Started { .. }));
        match next_event(&mut rx).await {
            ProcessEvent::Exited { code, requested, restarting, .. } => {
                assert_eq!(code, Some(0));
                assert!(!requested);
                assert!(!restarting);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            handle.stop(Duration::from_secs(1)).await.unwrap(),
            StopOutcome::AlreadyExited
        );
    }

    #[tokio::test]
    async fn test_restart_policy_respawns() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn("vm-4", spec("true", &[], true), tx).unwrap();

        assert!(matches!(next_event(&mut rx).await, ProcessEvent::Started { .. }));
        assert!(matches!(
            next_event(&mut rx).await,
            ProcessEvent::Exited { restarting: true, .. }
        ));
        assert_eq!(next_event(&mut rx).await, ProcessEvent::Restarting);
        assert!(matches!(next_event(&mut rx).await, ProcessEvent::Started { .. }));

        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = spawn("vm-5", spec("/nonexistent/bhyve", &[], true), tx);
        assert!(matches!(result, Err(Error::Hypervisor(_))));
        assert!(rx.try_recv().is_err());
    }
}
