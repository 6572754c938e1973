/// if_bridge 接口网桥实现
///
/// 一个网桥就是一个内核接口对象（bridgeN）
///
/// 工作原理：
/// 1. `ifconfig -g bridge` 列出所有网桥
/// 2. `ifconfig bridgeN` 输出中的 `member:` 行即成员列表
/// 3. 成员通过 `addm` / `deletem` 加入或移出网桥

use async_trait::async_trait;
use common::{Error, Result, SwitchType};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::command::{CommandRunner, IFCONFIG};
use crate::network::backend::SwitchBackend;
use crate::network::find_free_unit_desc;

#[derive(Clone)]
pub struct IfBridge {
    runner: Arc<dyn CommandRunner>,
    /// 守护进程创建的接口统一加入的接口组
    group: String,
}

impl IfBridge {
    pub fn new(runner: Arc<dyn CommandRunner>, group: impl Into<String>) -> Self {
        Self {
            runner,
            group: group.into(),
        }
    }

    /// 列出宿主机上的所有网络接口 (`ifconfig -l`)
    pub async fn interfaces(&self) -> Result<Vec<String>> {
        let stdout = self.runner.run_ok(IFCONFIG, &["-l"]).await?;
        Ok(parse_interface_list(&stdout))
    }

    /// 列出某个接口组中的接口 (`ifconfig -g <group>`)
    ///
    /// 空组返回空输出和零退出码；非零退出码一律视为列举失败
    pub async fn group_members(&self, group: &str) -> Result<Vec<String>> {
        let stdout = self.runner.run_ok(IFCONFIG, &["-g", group]).await?;
        Ok(parse_interface_list(&stdout))
    }

    /// 创建带守护进程组标签的接口，返回内核实际分配的接口名
    pub async fn create_tagged(&self, name: &str, description: &str) -> Result<String> {
        let stdout = self
            .runner
            .run_ok(
                IFCONFIG,
                &[name, "create", "group", self.group.as_str(), "description", description, "up"],
            )
            .await?;
        let created = stdout.trim();
        Ok(if created.is_empty() {
            name.to_string()
        } else {
            created.to_string()
        })
    }

    /// 销毁接口
    pub async fn destroy_interface(&self, name: &str) -> Result<()> {
        self.runner.run_ok(IFCONFIG, &[name, "destroy"]).await?;
        Ok(())
    }

    /// 设置接口为 UP 状态
    async fn set_interface_up(&self, name: &str) {
        match self.runner.run(IFCONFIG, &[name, "up"]).await {
            Ok(output) if !output.success() => {
                // 不返回错误，因为这可能不是致命问题
                warn!("设置接口 {} 为 UP 失败: {}", name, output.stderr.trim());
            }
            Err(e) => warn!("设置接口 {} 为 UP 失败: {}", name, e),
            _ => {}
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }
}

#[async_trait]
impl SwitchBackend for IfBridge {
    fn switch_type(&self) -> SwitchType {
        SwitchType::If
    }

    async fn list(&self) -> Result<Vec<String>> {
        self.group_members("bridge").await
    }

    async fn create(&self, name: &str) -> Result<()> {
        info!("创建 if_bridge: {}", name);
        self.create_tagged(name, &format!("easyvm switch {}", name))
            .await
            .map_err(|e| Error::Network(format!("创建网桥 {} 失败: {}", name, e)))?;
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        info!("销毁 if_bridge: {}", name);

        // 1. 尽力移除所有成员，单个失败只记录日志
        match self.members(name).await {
            Ok(members) => {
                for member in members {
                    if let Err(e) = self.remove_member(name, &member).await {
                        warn!("从网桥 {} 移除成员 {} 失败: {}", name, member, e);
                    }
                }
            }
            Err(e) => warn!("读取网桥 {} 成员失败: {}", name, e),
        }

        // 2. 销毁网桥本体
        self.destroy_interface(name)
            .await
            .map_err(|e| Error::Network(format!("销毁网桥 {} 失败: {}", name, e)))
    }

    async fn members(&self, name: &str) -> Result<Vec<String>> {
        let stdout = self.runner.run_ok(IFCONFIG, &[name]).await?;
        Ok(parse_bridge_members(&stdout))
    }

    async fn add_member(&self, name: &str, member: &str) -> Result<()> {
        info!("将 {} 添加到网桥 {}", member, name);
        self.runner.run_ok(IFCONFIG, &[name, "addm", member]).await?;
        self.set_interface_up(member).await;
        Ok(())
    }

    async fn remove_member(&self, name: &str, member: &str) -> Result<()> {
        info!("从网桥 {} 移除接口 {}", name, member);
        self.runner.run_ok(IFCONFIG, &[name, "deletem", member]).await?;
        Ok(())
    }

    async fn next_link(&self, _name: &str, _reserved: &[String]) -> Result<Option<String>> {
        Ok(None)
    }

    async fn allocate_dummy(&self) -> Result<Option<String>> {
        let existing: HashSet<String> = self.interfaces().await?.into_iter().collect();
        Ok(find_free_unit_desc("bridge", |candidate| existing.contains(candidate)))
    }
}

/// 解析 `ifconfig -l` / `ifconfig -g` 的输出（空白分隔的接口名）
pub fn parse_interface_list(stdout: &str) -> Vec<String> {
    stdout.split_whitespace().map(str::to_string).collect()
}

/// 解析 `ifconfig bridgeN` 输出中的成员
///
/// ```text
/// bridge0: flags=8843<UP,BROADCAST,RUNNING,SIMPLEX,MULTICAST> metric 0 mtu 1500
///         member: tap0 flags=143<LEARNING,DISCOVER,AUTOEDGE,AUTOPTP>
///         member: em0 flags=143<LEARNING,DISCOVER,AUTOEDGE,AUTOPTP>
/// ```
pub fn parse_bridge_members(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("member:") => fields.next().map(str::to_string),
                _ => None,
            }
        })
        .collect()
}
