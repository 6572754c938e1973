/// 外部命令执行
///
/// 所有内核网络命令都经过 [`CommandRunner`]，命令的文本输出是当前拓扑的唯一事实来源

use async_trait::async_trait;
use common::{Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

pub const IFCONFIG: &str = "/sbin/ifconfig";
pub const NGCTL: &str = "/usr/sbin/ngctl";
pub const RCTL: &str = "/usr/bin/rctl";

/// 命令执行结果
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// 外部命令执行器 Trait
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// 执行命令并返回原始输出，非零退出码不视为错误
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// 执行命令，非零退出码转换为 [`Error::Command`]
    async fn run_ok(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(Error::Command {
                program: program.to_string(),
                args: args.join(" "),
                message: format!("退出码 {}: {}", output.status, output.stderr.trim()),
            });
        }
        Ok(output.stdout)
    }
}

/// 系统命令执行器
///
/// 可选地通过 sudo 提权；每条命令都有超时上限，超时或调用方放弃 future 时子进程被杀掉
pub struct SystemRunner {
    sudo: Option<String>,
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(sudo: Option<String>, timeout: Duration) -> Self {
        Self {
            sudo: sudo.filter(|s| !s.is_empty()),
            timeout,
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = match &self.sudo {
            Some(sudo) => {
                let mut cmd = Command::new(sudo);
                cmd.arg(program);
                cmd
            }
            None => Command::new(program),
        };
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("执行命令: {} {}", program, args.join(" "));

        let command_error = |message: String| Error::Command {
            program: program.to_string(),
            args: args.join(" "),
            message,
        };

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| command_error(format!("执行超时 ({:?})", self.timeout)))?
            .map_err(|e| command_error(format!("执行命令失败: {}", e)))?;

        let result = CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            warn!(
                "命令返回非零退出码: {} {} -> {} {}",
                program,
                args.join(" "),
                result.status,
                result.stderr.trim()
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(None, Duration::from_secs(5));
        let out = runner.run("echo", &["hello"]).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_ok_maps_failure() {
        let runner = SystemRunner::new(None, Duration::from_secs(5));
        let err = runner.run_ok("false", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_system_runner_timeout() {
        let runner = SystemRunner::new(None, Duration::from_millis(100));
        let err = runner.run("sleep", &["5"]).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }
}
