/// 交换机引擎
///
/// 对外的统一入口：按交换机类型选择后端，并负责
/// - 跨交换机的上联 / 成员唯一性检查（以内核实时状态为准）
/// - 虚拟网卡设备 (tapN / vmnetN) 的创建
/// - 基于 epair + ng_pipe 的网卡限速
///
/// 注意：引擎内部不加锁，"先查询再修改" 在并发调用下存在竞争，
/// 调用方需要自行串行化交换机变更操作

use common::utils::{validate_interface_name, validate_switch_name};
use common::{Error, NicDevType, Result, SwitchType};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;
use crate::network::backend::SwitchBackend;
use crate::network::bridge::IfBridge;
use crate::network::netgraph::NgBridge;
use crate::network::{find_free_unit_asc, find_free_unit_desc};

/// 限速链路：tap ⇄ ng_pipe ⇄ epairNa ⇄ epairNb ⇄ bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitLink {
    /// epair 基础名，例如 epair32767
    pub epair: String,
    /// ng_pipe 节点名
    pub pipe: String,
}

impl RateLimitLink {
    pub fn from_epair(epair: &str) -> Self {
        Self {
            epair: epair.to_string(),
            pipe: format!("pipe_{}", epair),
        }
    }

    /// 接入 ng_pipe 的一端
    pub fn pipe_side(&self) -> String {
        format!("{}a", self.epair)
    }

    /// 加入交换机的一端
    pub fn switch_side(&self) -> String {
        format!("{}b", self.epair)
    }
}

#[derive(Clone)]
pub struct SwitchEngine {
    if_bridge: IfBridge,
    ng_bridge: NgBridge,
}

impl SwitchEngine {
    pub fn new(runner: Arc<dyn CommandRunner>, group: impl Into<String>) -> Self {
        let if_bridge = IfBridge::new(runner.clone(), group);
        let ng_bridge = NgBridge::new(runner, if_bridge.clone());
        Self {
            if_bridge,
            ng_bridge,
        }
    }

    /// 按交换机类型选择后端
    pub fn backend(&self, switch_type: SwitchType) -> &dyn SwitchBackend {
        match switch_type {
            SwitchType::If => &self.if_bridge,
            SwitchType::Ng => &self.ng_bridge,
        }
    }

    /// 守护进程接口组标签
    pub fn group(&self) -> &str {
        self.if_bridge.group()
    }

    pub async fn switch_exists(&self, name: &str, switch_type: SwitchType) -> Result<bool> {
        self.backend(switch_type).exists(name).await
    }

    /// 在同类型的所有网桥中查找已包含该接口的网桥
    pub async fn find_member_owner(
        &self,
        switch_type: SwitchType,
        ifname: &str,
    ) -> Result<Option<String>> {
        let backend = self.backend(switch_type);
        for bridge in backend.list().await? {
            let members = backend.members(&bridge).await?;
            if members.iter().any(|m| m == ifname) {
                return Ok(Some(bridge));
            }
        }
        Ok(None)
    }

    /// 检查接口未被同类型的其他网桥占用；已在本网桥上时返回 true
    async fn ensure_member_free(
        &self,
        switch_type: SwitchType,
        switch_name: &str,
        ifname: &str,
    ) -> Result<bool> {
        match self.find_member_owner(switch_type, ifname).await? {
            Some(owner) if owner == switch_name => Ok(true),
            Some(owner) => Err(Error::Conflict(format!(
                "接口 {} 已是交换机 {} 的成员",
                ifname, owner
            ))),
            None => Ok(false),
        }
    }

    async fn require_switch(&self, name: &str, switch_type: SwitchType) -> Result<()> {
        if !self.switch_exists(name, switch_type).await? {
            return Err(Error::NotFound(format!("交换机 {} 不存在于内核", name)));
        }
        Ok(())
    }

    /// 创建交换机，可选地同时设置上联
    pub async fn create_switch(
        &self,
        name: &str,
        switch_type: SwitchType,
        uplink: Option<&str>,
    ) -> Result<()> {
        validate_switch_name(name, switch_type)?;
        if let Some(uplink) = uplink {
            validate_interface_name(uplink)?;
        }

        let backend = self.backend(switch_type);
        if backend.exists(name).await? {
            return Err(Error::AlreadyExists(format!("交换机 {} 已存在于内核", name)));
        }

        backend.create(name).await?;

        if let Some(uplink) = uplink {
            if let Err(e) = self.set_uplink(name, switch_type, uplink).await {
                warn!("设置上联 {} 失败，回滚交换机 {}", uplink, name);
                if let Err(cleanup) = backend.destroy(name).await {
                    warn!("回滚交换机 {} 失败: {}", name, cleanup);
                }
                return Err(e);
            }
        }

        info!("✅ 交换机 {} ({}) 创建成功", name, switch_type);
        Ok(())
    }

    /// 销毁交换机；内核中不存在时直接返回
    pub async fn destroy_switch(&self, name: &str, switch_type: SwitchType) -> Result<()> {
        let backend = self.backend(switch_type);
        if !backend.exists(name).await? {
            debug!("交换机 {} 不存在于内核，跳过销毁", name);
            return Ok(());
        }
        backend.destroy(name).await
    }

    /// 设置上联接口
    pub async fn set_uplink(&self, name: &str, switch_type: SwitchType, ifname: &str) -> Result<()> {
        validate_interface_name(ifname)?;
        self.require_switch(name, switch_type).await?;

        let interfaces = self.if_bridge.interfaces().await?;
        if !interfaces.iter().any(|i| i == ifname) {
            return Err(Error::NotFound(format!("宿主机接口 {} 不存在", ifname)));
        }

        if self.ensure_member_free(switch_type, name, ifname).await? {
            info!("接口 {} 已是交换机 {} 的上联", ifname, name);
            return Ok(());
        }

        self.backend(switch_type).add_member(name, ifname).await?;
        info!("✅ 交换机 {} 上联设置为 {}", name, ifname);
        Ok(())
    }

    /// 取消上联接口
    pub async fn unset_uplink(&self, name: &str, switch_type: SwitchType, ifname: &str) -> Result<()> {
        let backend = self.backend(switch_type);
        if !backend.exists(name).await? {
            return Ok(());
        }
        if backend.members(name).await?.iter().any(|m| m == ifname) {
            backend.remove_member(name, ifname).await?;
            info!("交换机 {} 已移除上联 {}", name, ifname);
        }
        Ok(())
    }

    /// 将虚拟机侧接口加入交换机
    pub async fn attach_member(&self, name: &str, switch_type: SwitchType, member: &str) -> Result<()> {
        self.require_switch(name, switch_type).await?;
        if self.ensure_member_free(switch_type, name, member).await? {
            return Ok(());
        }
        self.backend(switch_type).add_member(name, member).await
    }

    /// netgraph 交换机上下一个空闲钩子
    ///
    /// 钩子要等 bhyve 进程启动后才真正连接，同一次启动中已分配的钩子通过 `reserved` 传入
    pub async fn next_link(&self, name: &str, switch_type: SwitchType, reserved: &[String]) -> Result<String> {
        self.require_switch(name, switch_type).await?;
        self.backend(switch_type)
            .next_link(name, reserved)
            .await?
            .ok_or_else(|| Error::Network(format!("交换机 {} 没有可分配的钩子", name)))
    }

    /// 宿主机所有接口
    pub async fn interfaces(&self) -> Result<Vec<String>> {
        self.if_bridge.interfaces().await
    }

    /// 带守护进程组标签的接口
    pub async fn tagged_interfaces(&self) -> Result<Vec<String>> {
        self.if_bridge.group_members(self.group()).await
    }

    /// 销毁一个宿主机接口
    pub async fn destroy_interface(&self, name: &str) -> Result<()> {
        self.if_bridge.destroy_interface(name).await
    }

    /// 为虚拟网卡创建新的 tapN / vmnetN 设备（最小空闲编号）
    pub async fn create_nic_device(&self, dev_type: NicDevType, description: &str) -> Result<String> {
        let prefix = dev_type.interface_prefix().ok_or_else(|| {
            Error::InvalidArgument(format!("{} 设备没有对应的内核接口", dev_type.as_str()))
        })?;
        let existing: HashSet<String> = self.interfaces().await?.into_iter().collect();
        let name = find_free_unit_asc(prefix, |candidate| existing.contains(candidate))
            .ok_or_else(|| Error::Network(format!("没有可用的 {} 设备编号", prefix)))?;
        let created = self.if_bridge.create_tagged(&name, description).await?;
        info!("创建网卡设备: {}", created);
        Ok(created)
    }

    /// 网卡是否会启用限速；netgraph 设备始终不启用
    pub fn rate_limit_enabled(dev_type: NicDevType, requested: bool) -> bool {
        requested && dev_type.supports_rate_limit()
    }

    /// 分配一个临时 epair 名（从最大编号向下探测）
    pub async fn allocate_epair(&self) -> Result<Option<String>> {
        let existing: HashSet<String> = self.interfaces().await?.into_iter().collect();
        Ok(find_free_unit_desc("epair", |candidate| {
            existing.contains(&format!("{}a", candidate)) || existing.contains(&format!("{}b", candidate))
        }))
    }

    /// 在网卡设备和交换机之间插入 ng_pipe 限速节点
    ///
    /// 返回的链路中 `switch_side()` 需要由调用方加入交换机；
    /// 不支持限速的设备类型返回 None
    pub async fn attach_rate_limit(
        &self,
        dev_type: NicDevType,
        member: &str,
        rate_in: u64,
        rate_out: u64,
    ) -> Result<Option<RateLimitLink>> {
        if !Self::rate_limit_enabled(dev_type, true) {
            debug!("{} 设备不支持限速", dev_type.as_str());
            return Ok(None);
        }

        let epair = self
            .allocate_epair()
            .await?
            .ok_or_else(|| Error::Network("没有可用的 epair 编号".to_string()))?;
        let link = RateLimitLink::from_epair(&epair);

        info!(
            "为 {} 创建限速链路 {} (in={} bit/s, out={} bit/s)",
            member, epair, rate_in, rate_out
        );
        self.if_bridge
            .create_tagged(&epair, &format!("easyvm rate limit {}", member))
            .await?;

        if let Err(e) = self.wire_pipe(&link, member, rate_in, rate_out).await {
            warn!("配置限速链路 {} 失败，清理中", epair);
            self.detach_rate_limit(&link).await;
            return Err(e);
        }

        Ok(Some(link))
    }

    async fn wire_pipe(&self, link: &RateLimitLink, member: &str, rate_in: u64, rate_out: u64) -> Result<()> {
        let ng = &self.ng_bridge;
        let pipe_side = link.pipe_side();

        // epairNa:lower ⇄ pipe:upper
        ng.mkpeer(&pipe_side, "pipe", "lower", "upper").await?;
        ng.name_node(&format!("{}:lower", pipe_side), &link.pipe).await?;
        // pipe:lower ⇄ tap:lower
        ng.connect(&link.pipe, member, "lower", "lower").await?;

        // upstream 为 lower → upper 方向，即虚拟机发出的流量
        let cfg = format!(
            "{{ upstream={{ bandwidth={} fifo=1 }} downstream={{ bandwidth={} fifo=1 }} }}",
            rate_out, rate_in
        );
        ng.msg(&link.pipe, &["setcfg", &cfg]).await
    }

    /// 拆除限速链路，尽力而为
    pub async fn detach_rate_limit(&self, link: &RateLimitLink) {
        if let Err(e) = self.ng_bridge.shutdown(&link.pipe).await {
            debug!("关闭 ng_pipe {} 失败: {}", link.pipe, e);
        }
        if let Err(e) = self.if_bridge.destroy_interface(&link.pipe_side()).await {
            warn!("销毁 epair {} 失败: {}", link.epair, e);
        }
    }
}
