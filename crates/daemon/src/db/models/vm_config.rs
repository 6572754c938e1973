/// 虚拟机配置数据模型（与 vms 一对一）

use host::hypervisor::ResourceLimits;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vm_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub vm_id: String,
    pub cpus: i32,
    pub memory_mb: i64,

    // bhyve 选项
    pub wire_memory: bool,
    pub utc_clock: bool,
    pub acpi: bool,
    pub yield_on_hlt: bool,
    pub exit_on_pause: bool,
    pub com1: bool,
    pub bootrom: Option<String>,
    pub bootrom_vars: Option<String>,

    // 监管策略
    pub restart: bool,
    pub restart_delay_secs: i32,
    pub stop_timeout_secs: Option<i32>,

    // rctl 资源限制
    pub pcpu: Option<i32>,
    pub read_bps: Option<i64>,
    pub write_bps: Option<i64>,
    pub read_iops: Option<i64>,
    pub write_iops: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::vm::Entity",
        from = "Column::VmId",
        to = "super::vm::Column::Id"
    )]
    Vm,
}

impl Related<super::vm::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vm.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn limits(&self) -> ResourceLimits {
        let positive = |v: Option<i64>| v.and_then(|v| u64::try_from(v).ok());
        ResourceLimits {
            pcpu: self.pcpu.and_then(|v| u32::try_from(v).ok()),
            read_bps: positive(self.read_bps),
            write_bps: positive(self.write_bps),
            read_iops: positive(self.read_iops),
            write_iops: positive(self.write_iops),
        }
    }
}

/// 创建 / 更新虚拟机配置 DTO，未提供的字段保持原值（创建时取默认值）
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateVmConfigDto {
    #[validate(range(min = 1, max = 256))]
    pub cpus: Option<i32>,
    #[validate(range(min = 32))]
    pub memory_mb: Option<i64>,
    pub wire_memory: Option<bool>,
    pub utc_clock: Option<bool>,
    pub acpi: Option<bool>,
    pub yield_on_hlt: Option<bool>,
    pub exit_on_pause: Option<bool>,
    pub com1: Option<bool>,
    pub bootrom: Option<String>,
    pub bootrom_vars: Option<String>,
    pub restart: Option<bool>,
    #[validate(range(min = 0, max = 3600))]
    pub restart_delay_secs: Option<i32>,
    #[validate(range(min = 1, max = 3600))]
    pub stop_timeout_secs: Option<i32>,
    #[validate(range(min = 1))]
    pub pcpu: Option<i32>,
    #[validate(range(min = 0))]
    pub read_bps: Option<i64>,
    #[validate(range(min = 0))]
    pub write_bps: Option<i64>,
    #[validate(range(min = 0))]
    pub read_iops: Option<i64>,
    #[validate(range(min = 0))]
    pub write_iops: Option<i64>,
}

impl UpdateVmConfigDto {
    /// 应用到 ActiveModel
    pub fn apply(self, active: &mut ActiveModel) {
        use sea_orm::Set;

        if let Some(v) = self.cpus {
            active.cpus = Set(v);
        }
        if let Some(v) = self.memory_mb {
            active.memory_mb = Set(v);
        }
        if let Some(v) = self.wire_memory {
            active.wire_memory = Set(v);
        }
        if let Some(v) = self.utc_clock {
            active.utc_clock = Set(v);
        }
        if let Some(v) = self.acpi {
            active.acpi = Set(v);
        }
        if let Some(v) = self.yield_on_hlt {
            active.yield_on_hlt = Set(v);
        }
        if let Some(v) = self.exit_on_pause {
            active.exit_on_pause = Set(v);
        }
        if let Some(v) = self.com1 {
            active.com1 = Set(v);
        }
        if self.bootrom.is_some() {
            active.bootrom = Set(self.bootrom);
        }
        if self.bootrom_vars.is_some() {
            active.bootrom_vars = Set(self.bootrom_vars);
        }
        if let Some(v) = self.restart {
            active.restart = Set(v);
        }
        if let Some(v) = self.restart_delay_secs {
            active.restart_delay_secs = Set(v);
        }
        if self.stop_timeout_secs.is_some() {
            active.stop_timeout_secs = Set(self.stop_timeout_secs);
        }
        if self.pcpu.is_some() {
            active.pcpu = Set(self.pcpu);
        }
        if self.read_bps.is_some() {
            active.read_bps = Set(self.read_bps);
        }
        if self.write_bps.is_some() {
            active.write_bps = Set(self.write_bps);
        }
        if self.read_iops.is_some() {
            active.read_iops = Set(self.read_iops);
        }
        if self.write_iops.is_some() {
            active.write_iops = Set(self.write_iops);
        }
    }
}

/// 新虚拟机的默认配置
pub fn default_active(vm_id: &str) -> ActiveModel {
    use sea_orm::Set;

    ActiveModel {
        vm_id: Set(vm_id.to_string()),
        cpus: Set(1),
        memory_mb: Set(512),
        wire_memory: Set(false),
        utc_clock: Set(true),
        acpi: Set(true),
        yield_on_hlt: Set(true),
        exit_on_pause: Set(true),
        com1: Set(true),
        bootrom: Set(None),
        bootrom_vars: Set(None),
        restart: Set(false),
        restart_delay_secs: Set(5),
        stop_timeout_secs: Set(None),
        pcpu: Set(None),
        read_bps: Set(None),
        write_bps: Set(None),
        read_iops: Set(None),
        write_iops: Set(None),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VmConfigResponse {
    pub cpus: i32,
    pub memory_mb: i64,
    pub wire_memory: bool,
    pub utc_clock: bool,
    pub acpi: bool,
    pub yield_on_hlt: bool,
    pub exit_on_pause: bool,
    pub com1: bool,
    pub bootrom: Option<String>,
    pub bootrom_vars: Option<String>,
    pub restart: bool,
    pub restart_delay_secs: i32,
    pub stop_timeout_secs: Option<i32>,
    pub limits: ResourceLimits,
}

impl From<Model> for VmConfigResponse {
    fn from(config: Model) -> Self {
        let limits = config.limits();
        Self {
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            wire_memory: config.wire_memory,
            utc_clock: config.utc_clock,
            acpi: config.acpi,
            yield_on_hlt: config.yield_on_hlt,
            exit_on_pause: config.exit_on_pause,
            com1: config.com1,
            bootrom: config.bootrom,
            bootrom_vars: config.bootrom_vars,
            restart: config.restart,
            restart_delay_secs: config.restart_delay_secs,
            stop_timeout_secs: config.stop_timeout_secs,
            limits,
        }
    }
}
