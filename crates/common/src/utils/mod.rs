/// 工具函数集合
///
/// 资源 ID、名称格式校验，以及网卡 MAC 生成

use rand::Rng;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::models::constants::{MAX_IFNAME_LEN, MAX_UNIT, MAX_VM_NAME_LEN};
use crate::models::SwitchType;

/// 生成唯一 ID
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// 校验资源 ID 必须是 UUID 格式
pub fn validate_id(id: &str) -> Result<()> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| Error::InvalidArgument(format!("无效的资源 ID: {}", id)))
}

/// 解析 `<prefix><N>` 形式的单元号
///
/// N 必须是十进制、不含前导零（`0` 本身除外），且不超过 [`MAX_UNIT`]
pub fn parse_unit(name: &str, prefix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let unit: u32 = digits.parse().ok()?;
    (unit <= MAX_UNIT).then_some(unit)
}

/// 校验交换机名称与后端类型匹配
///
/// IF 后端只接受 `bridge0`…`bridge32767`，NG 后端只接受 `bnet0`…`bnet32767`
pub fn validate_switch_name(name: &str, switch_type: SwitchType) -> Result<()> {
    if parse_unit(name, switch_type.name_prefix()).is_none() {
        return Err(Error::InvalidArgument(format!(
            "交换机名称 {} 与类型 {} 不匹配",
            name, switch_type
        )));
    }
    Ok(())
}

/// 校验通用资源名称（虚拟机、网卡、磁盘）
///
/// 只允许字母、数字、`-`、`_`、`.`，且不能以 `.` 开头
pub fn validate_resource_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_VM_NAME_LEN {
        return Err(Error::InvalidArgument(format!(
            "名称长度必须在 1 到 {} 之间: {}",
            MAX_VM_NAME_LEN, name
        )));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidArgument(format!("名称不能以 . 开头: {}", name)));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(Error::InvalidArgument(format!("名称包含非法字符: {}", name)));
    }
    Ok(())
}

/// 校验主机网络接口名（上联接口）
pub fn validate_interface_name(ifname: &str) -> Result<()> {
    let valid = !ifname.is_empty()
        && ifname.len() <= MAX_IFNAME_LEN
        && ifname
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic())
            .unwrap_or(false)
        && ifname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if !valid {
        return Err(Error::InvalidArgument(format!("无效的接口名: {}", ifname)));
    }
    Ok(())
}

/// 验证 MAC 地址格式
pub fn validate_mac_address(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }

    parts
        .iter()
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// 生成 bhyve 厂商前缀 (58:9c:fc) 的随机 MAC 地址
pub fn generate_mac_address() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "58:9c:fc:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
