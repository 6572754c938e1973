/// 进程资源限制 (rctl)
///
/// 规则以 `process:<pid>:<resource>:deny=<amount>` 的形式作用于 bhyve 进程，
/// 进程重启后 pid 变化，需要重新应用

use common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::{CommandRunner, RCTL};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU 百分比，100 表示一个核
    pub pcpu: Option<u32>,
    pub read_bps: Option<u64>,
    pub write_bps: Option<u64>,
    pub read_iops: Option<u64>,
    pub write_iops: Option<u64>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.rules(0).is_empty()
    }

    pub fn rules(&self, pid: u32) -> Vec<String> {
        let entries = [
            ("pcpu", self.pcpu.map(u64::from)),
            ("readbps", self.read_bps),
            ("writebps", self.write_bps),
            ("readiops", self.read_iops),
            ("writeiops", self.write_iops),
        ];
        entries
            .iter()
            .filter_map(|(resource, amount)| {
                amount
                    .filter(|a| *a > 0)
                    .map(|a| format!("process:{}:{}:deny={}", pid, resource, a))
            })
            .collect()
    }
}

/// 应用限制，单条规则失败只记录日志
pub async fn apply(runner: &Arc<dyn CommandRunner>, pid: u32, limits: &ResourceLimits) -> Result<()> {
    for rule in limits.rules(pid) {
        match runner.run_ok(RCTL, &["-a", &rule]).await {
            Ok(_) => info!("应用资源限制: {}", rule),
            Err(e) => warn!("应用资源限制 {} 失败: {}", rule, e),
        }
    }
    Ok(())
}

/// 移除进程上的所有限制
pub async fn clear(runner: &Arc<dyn CommandRunner>, pid: u32) {
    let filter = format!("process:{}", pid);
    if let Err(e) = runner.run_ok(RCTL, &["-r", &filter]).await {
        warn!("移除进程 {} 的资源限制失败: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::fake::FakeKernel;

    #[test]
    fn test_rules_skip_unset_and_zero() {
        let limits = ResourceLimits {
            pcpu: Some(50),
            read_bps: Some(0),
            write_iops: Some(300),
            ..Default::default()
        };
        assert_eq!(
            limits.rules(42),
            vec!["process:42:pcpu:deny=50", "process:42:writeiops:deny=300"]
        );
        assert!(ResourceLimits::default().is_empty());
    }

    #[tokio::test]
    async fn test_apply_issues_rctl() {
        let kernel = Arc::new(FakeKernel::new());
        let runner: Arc<dyn CommandRunner> = kernel.clone();
        let limits = ResourceLimits {
            pcpu: Some(100),
            ..Default::default()
        };
        apply(&runner, 7, &limits).await.unwrap();
        assert_eq!(kernel.commands(), vec!["rctl -a process:7:pcpu:deny=100"]);
    }
}
