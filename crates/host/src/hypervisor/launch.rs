/// bhyve 启动命令构建
///
/// 由虚拟机配置生成被监管进程的命令行。PCI 插槽布局：
/// - 0: hostbridge
/// - 1..=30: 磁盘在前，网卡在后
/// - 31: lpc（COM 口和启动 ROM）

use async_trait::async_trait;
use common::{DiskEmulation, Error, NicEmulation, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::command::CommandRunner;
use crate::hypervisor::supervisor::{ProcessSpec, RestartPolicy};

const FIRST_DEVICE_SLOT: u32 = 1;
const LAST_DEVICE_SLOT: u32 = 30;

/// 网卡在宿主机侧的接入方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicAttachment {
    /// tapN / vmnetN 设备
    Device(String),
    /// netgraph 网桥上的一个钩子
    Netgraph { switch: String, link: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchNic {
    pub emulation: NicEmulation,
    pub attachment: NicAttachment,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchDisk {
    pub emulation: DiskEmulation,
    pub path: String,
}

/// 一次启动所需的全部信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmLaunchSpec {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub wire_memory: bool,
    pub utc_clock: bool,
    pub acpi: bool,
    pub yield_on_hlt: bool,
    pub exit_on_pause: bool,
    /// COM1 使用的 nmdm 设备，例如 /dev/nmdm-web-A
    pub com1: Option<String>,
    pub bootrom: Option<String>,
    pub bootrom_vars: Option<String>,
    pub nics: Vec<LaunchNic>,
    pub disks: Vec<LaunchDisk>,
    pub restart: bool,
    pub restart_delay_secs: u64,
}

impl VmLaunchSpec {
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            enabled: self.restart,
            delay: Duration::from_secs(self.restart_delay_secs),
        }
    }
}

/// 启动命令构建器 Trait
#[async_trait]
pub trait LaunchBuilder: Send + Sync + 'static {
    fn build(&self, spec: &VmLaunchSpec) -> Result<ProcessSpec>;

    /// 进程退出后释放虚拟化层残留资源
    async fn release(&self, _vm_name: &str) -> Result<()> {
        Ok(())
    }
}

pub struct BhyveLaunch {
    bhyve_path: String,
    bhyvectl_path: String,
    runner: Arc<dyn CommandRunner>,
}

impl BhyveLaunch {
    pub fn new(
        bhyve_path: impl Into<String>,
        bhyvectl_path: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            bhyve_path: bhyve_path.into(),
            bhyvectl_path: bhyvectl_path.into(),
            runner,
        }
    }
}

#[async_trait]
impl LaunchBuilder for BhyveLaunch {
    fn build(&self, spec: &VmLaunchSpec) -> Result<ProcessSpec> {
        if spec.cpus == 0 || spec.memory_mb == 0 {
            return Err(Error::InvalidArgument(format!(
                "虚拟机 {} 的 CPU 或内存配置无效",
                spec.name
            )));
        }

        let mut args: Vec<String> = Vec::new();
        let flags = [
            (spec.acpi, "-A"),
            (spec.yield_on_hlt, "-H"),
            (spec.exit_on_pause, "-P"),
            (spec.utc_clock, "-u"),
            (spec.wire_memory, "-S"),
        ];
        args.extend(flags.iter().filter(|(on, _)| *on).map(|(_, f)| f.to_string()));
        args.push("-w".to_string());

        args.push("-c".to_string());
        args.push(spec.cpus.to_string());
        args.push("-m".to_string());
        args.push(format!("{}M", spec.memory_mb));

        args.push("-s".to_string());
        args.push("0,hostbridge".to_string());

        let mut slot = FIRST_DEVICE_SLOT;
        let mut next_slot = || -> Result<u32> {
            if slot > LAST_DEVICE_SLOT {
                return Err(Error::InvalidArgument(format!(
                    "虚拟机 {} 的设备数量超过可用 PCI 插槽",
                    spec.name
                )));
            }
            slot += 1;
            Ok(slot - 1)
        };

        for disk in &spec.disks {
            args.push("-s".to_string());
            args.push(format!("{},{},{}", next_slot()?, disk.emulation.as_str(), disk.path));
        }

        for nic in &spec.nics {
            let backend = match &nic.attachment {
                NicAttachment::Device(dev) => dev.clone(),
                NicAttachment::Netgraph { switch, link } => {
                    format!("netgraph,path={}:,peerhook={}", switch, link)
                }
            };
            args.push("-s".to_string());
            args.push(format!(
                "{},{},{},mac={}",
                next_slot()?,
                nic.emulation.as_str(),
                backend,
                nic.mac
            ));
        }

        args.push("-s".to_string());
        args.push("31,lpc".to_string());
        if let Some(com1) = &spec.com1 {
            args.push("-l".to_string());
            args.push(format!("com1,{}", com1));
        }
        if let Some(rom) = &spec.bootrom {
            args.push("-l".to_string());
            match &spec.bootrom_vars {
                Some(vars) => args.push(format!("bootrom,{},{}", rom, vars)),
                None => args.push(format!("bootrom,{}", rom)),
            }
        }

        args.push(spec.name.clone());

        debug!("bhyve 命令行: {} {}", self.bhyve_path, args.join(" "));
        Ok(ProcessSpec {
            program: self.bhyve_path.clone(),
            args,
            restart: spec.restart_policy(),
        })
    }

    async fn release(&self, vm_name: &str) -> Result<()> {
        if !Path::new("/dev/vmm").join(vm_name).exists() {
            return Ok(());
        }
        let arg = format!("--vm={}", vm_name);
        if let Err(e) = self
            .runner
            .run_ok(&self.bhyvectl_path, &["--destroy", &arg])
            .await
        {
            warn!("销毁虚拟机 {} 的 vmm 设备失败: {}", vm_name, e);
            return Err(e);
        }
        Ok(())
    }
}

/// 固定命令构建器，不关心虚拟机配置
#[cfg(any(test, feature = "testing"))]
pub struct FixedLaunch {
    pub program: String,
    pub args: Vec<String>,
}

#[cfg(any(test, feature = "testing"))]
impl FixedLaunch {
    /// 长时间运行的 sleep 进程
    pub fn sleep() -> Self {
        Self {
            program: "sleep".to_string(),
            args: vec!["3600".to_string()],
        }
    }
}

#[cfg(any(test, feature = "testing"))]
#[async_trait]
impl LaunchBuilder for FixedLaunch {
    fn build(&self, spec: &VmLaunchSpec) -> Result<ProcessSpec> {
        Ok(ProcessSpec {
            program: self.program.clone(),
            args: self.args.clone(),
            restart: spec.restart_policy(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::fake::FakeKernel;

    fn base_spec() -> VmLaunchSpec {
        VmLaunchSpec {
            name: "web".to_string(),
            cpus: 2,
            memory_mb: 1024,
            wire_memory: true,
            utc_clock: true,
            acpi: true,
            yield_on_hlt: true,
            exit_on_pause: true,
            com1: Some("/dev/nmdm-web-A".to_string()),
            bootrom: Some("/usr/local/share/uefi-firmware/BHYVE_UEFI.fd".to_string()),
            bootrom_vars: None,
            nics: Vec::new(),
            disks: Vec::new(),
            restart: false,
            restart_delay_secs: 5,
        }
    }

    fn launcher() -> BhyveLaunch {
        BhyveLaunch::new("/usr/sbin/bhyve", "/usr/sbin/bhyvectl", Arc::new(FakeKernel::new()))
    }

    #[test]
    fn test_build_full_command_line() {
        let mut spec = base_spec();
        spec.disks.push(LaunchDisk {
            emulation: DiskEmulation::Nvme,
            path: "/vm/web/disk0.img".to_string(),
        });
        spec.nics.push(LaunchNic {
            emulation: NicEmulation::VirtioNet,
            attachment: NicAttachment::Device("tap0".to_string()),
            mac: "58:9c:fc:00:00:01".to_string(),
        });
        spec.nics.push(LaunchNic {
            emulation: NicEmulation::E1000,
            attachment: NicAttachment::Netgraph {
                switch: "bnet0".to_string(),
                link: "link2".to_string(),
            },
            mac: "58:9c:fc:00:00:02".to_string(),
        });

        let process = launcher().build(&spec).unwrap();
        assert_eq!(process.program, "/usr/sbin/bhyve");
        let line = process.args.join(" ");
        assert!(line.starts_with("-A -H -P -u -S -w -c 2 -m 1024M -s 0,hostbridge"));
        assert!(line.contains("-s 1,nvme,/vm/web/disk0.img"));
        assert!(line.contains("-s 2,virtio-net,tap0,mac=58:9c:fc:00:00:01"));
        assert!(line.contains("-s 3,e1000,netgraph,path=bnet0:,peerhook=link2,mac=58:9c:fc:00:00:02"));
        assert!(line.contains("-s 31,lpc -l com1,/dev/nmdm-web-A -l bootrom,"));
        assert_eq!(process.args.last().map(String::as_str), Some("web"));
    }

    #[test]
    fn test_build_rejects_too_many_devices() {
        let mut spec = base_spec();
        for i in 0..31 {
            spec.disks.push(LaunchDisk {
                emulation: DiskEmulation::VirtioBlk,
                path: format!("/vm/disk{}.img", i),
            });
        }
        assert!(matches!(launcher().build(&spec), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_build_rejects_zero_cpus() {
        let mut spec = base_spec();
        spec.cpus = 0;
        assert!(launcher().build(&spec).is_err());
    }

    #[test]
    fn test_restart_policy_from_config() {
        let mut spec = base_spec();
        spec.restart = true;
        let process = FixedLaunch::sleep().build(&spec).unwrap();
        assert!(process.restart.enabled);
        assert_eq!(process.restart.delay, Duration::from_secs(5));
    }
}
