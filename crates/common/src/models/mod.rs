/// 共享数据模型
///
/// 定义 Host 和 Daemon 共享的枚举和常量

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// 虚拟机状态
///
/// 合法迁移：STOPPED → STARTING → RUNNING → STOPPING → STOPPED
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
        }
    }

    /// 状态机中是否存在 self → next 这条边
    pub fn can_transition_to(&self, next: VmStatus) -> bool {
        matches!(
            (self, next),
            (VmStatus::Stopped, VmStatus::Starting)
                | (VmStatus::Starting, VmStatus::Running)
                | (VmStatus::Starting, VmStatus::Stopped)
                | (VmStatus::Running, VmStatus::Stopping)
                | (VmStatus::Running, VmStatus::Stopped)
                | (VmStatus::Stopping, VmStatus::Stopped)
        )
    }
}

impl FromStr for VmStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(VmStatus::Stopped),
            "starting" => Ok(VmStatus::Starting),
            "running" => Ok(VmStatus::Running),
            "stopping" => Ok(VmStatus::Stopping),
            _ => Err(Error::InvalidArgument(format!("未知的虚拟机状态: {}", s))),
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 交换机后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SwitchType {
    /// if_bridge 接口网桥，名称形如 bridgeN
    #[serde(rename = "IF")]
    If,
    /// netgraph ng_bridge 节点，名称形如 bnetN
    #[serde(rename = "NG")]
    Ng,
}

impl SwitchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchType::If => "IF",
            SwitchType::Ng => "NG",
        }
    }

    /// 该后端的交换机名称前缀
    pub fn name_prefix(&self) -> &'static str {
        match self {
            SwitchType::If => "bridge",
            SwitchType::Ng => "bnet",
        }
    }
}

impl FromStr for SwitchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IF" | "if" => Ok(SwitchType::If),
            "NG" | "ng" => Ok(SwitchType::Ng),
            _ => Err(Error::InvalidArgument(format!("未知的交换机类型: {}", s))),
        }
    }
}

impl fmt::Display for SwitchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 虚拟网卡后端设备类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum NicDevType {
    Tap,
    Vmnet,
    Netgraph,
}

impl NicDevType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicDevType::Tap => "TAP",
            NicDevType::Vmnet => "VMNET",
            NicDevType::Netgraph => "NETGRAPH",
        }
    }

    /// 该设备类型可以挂接的交换机类型
    pub fn switch_type(&self) -> SwitchType {
        match self {
            NicDevType::Tap | NicDevType::Vmnet => SwitchType::If,
            NicDevType::Netgraph => SwitchType::Ng,
        }
    }

    /// 是否支持 ng_pipe 限速
    pub fn supports_rate_limit(&self) -> bool {
        !matches!(self, NicDevType::Netgraph)
    }

    /// 内核接口名前缀（netgraph 设备没有接口）
    pub fn interface_prefix(&self) -> Option<&'static str> {
        match self {
            NicDevType::Tap => Some("tap"),
            NicDevType::Vmnet => Some("vmnet"),
            NicDevType::Netgraph => None,
        }
    }
}

impl FromStr for NicDevType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TAP" => Ok(NicDevType::Tap),
            "VMNET" => Ok(NicDevType::Vmnet),
            "NETGRAPH" => Ok(NicDevType::Netgraph),
            _ => Err(Error::InvalidArgument(format!("未知的网卡设备类型: {}", s))),
        }
    }
}

/// 虚拟网卡模拟类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NicEmulation {
    VirtioNet,
    E1000,
}

impl NicEmulation {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicEmulation::VirtioNet => "virtio-net",
            NicEmulation::E1000 => "e1000",
        }
    }
}

impl FromStr for NicEmulation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virtio-net" | "VIRTIONET" => Ok(NicEmulation::VirtioNet),
            "e1000" | "E1000" => Ok(NicEmulation::E1000),
            _ => Err(Error::InvalidArgument(format!("未知的网卡模拟类型: {}", s))),
        }
    }
}

/// 磁盘模拟类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DiskEmulation {
    Nvme,
    AhciHd,
    VirtioBlk,
}

impl DiskEmulation {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskEmulation::Nvme => "nvme",
            DiskEmulation::AhciHd => "ahci-hd",
            DiskEmulation::VirtioBlk => "virtio-blk",
        }
    }
}

impl FromStr for DiskEmulation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nvme" => Ok(DiskEmulation::Nvme),
            "ahci-hd" => Ok(DiskEmulation::AhciHd),
            "virtio-blk" => Ok(DiskEmulation::VirtioBlk),
            _ => Err(Error::InvalidArgument(format!("未知的磁盘模拟类型: {}", s))),
        }
    }
}

/// 异步请求类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    VmStart,
    VmStop,
    VmDelete,
    NicClone,
    DiskWipe,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::VmStart => "vm_start",
            RequestKind::VmStop => "vm_stop",
            RequestKind::VmDelete => "vm_delete",
            RequestKind::NicClone => "nic_clone",
            RequestKind::DiskWipe => "disk_wipe",
        }
    }
}

impl FromStr for RequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vm_start" => Ok(RequestKind::VmStart),
            "vm_stop" => Ok(RequestKind::VmStop),
            "vm_delete" => Ok(RequestKind::VmDelete),
            "nic_clone" => Ok(RequestKind::NicClone),
            "disk_wipe" => Ok(RequestKind::DiskWipe),
            _ => Err(Error::InvalidArgument(format!("未知的请求类型: {}", s))),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 常量定义
pub mod constants {
    /// 交换机 / 临时网桥 / epair 编号上限
    pub const MAX_UNIT: u32 = 32767;

    /// 默认 RPC 监听地址
    pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8890";

    /// 默认守护进程接口组标签
    pub const DEFAULT_INTERFACE_GROUP: &str = "easyvm";

    /// 默认请求轮询间隔（毫秒）
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

    /// 默认外部命令超时（秒）
    pub const DEFAULT_COMMAND_TIMEOUT: u64 = 30;

    /// 默认优雅停机等待时间（秒）
    pub const DEFAULT_STOP_TIMEOUT: u64 = 120;

    /// 虚拟机名称最大长度
    pub const MAX_VM_NAME_LEN: usize = 32;

    /// 网络接口名最大长度 (IFNAMSIZ - 1)
    pub const MAX_IFNAME_LEN: usize = 15;
}
