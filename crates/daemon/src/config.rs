/// 配置管理

use common::constants;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub database_url: String,
    pub log_level: String,
    /// 内核命令的提权前缀，例如 sudo / doas
    pub sudo: Option<String>,
    pub bhyve_path: String,
    pub bhyvectl_path: String,
    /// 守护进程创建的接口统一打上的接口组标签
    pub interface_group: String,
    pub poll_interval_ms: u64,
    pub command_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: constants::DEFAULT_LISTEN_ADDR.to_string(),
            database_url: "sqlite:///var/db/easyvm/easyvm.db?mode=rwc".to_string(),
            log_level: "info".to_string(),
            sudo: None,
            bhyve_path: "/usr/sbin/bhyve".to_string(),
            bhyvectl_path: "/usr/sbin/bhyvectl".to_string(),
            interface_group: constants::DEFAULT_INTERFACE_GROUP.to_string(),
            poll_interval_ms: constants::DEFAULT_POLL_INTERVAL_MS,
            command_timeout_secs: constants::DEFAULT_COMMAND_TIMEOUT,
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr);
        let database_url = std::env::var("DATABASE_URL").unwrap_or(defaults.database_url);
        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);
        let sudo = std::env::var("SUDO").ok().filter(|s| !s.is_empty());
        let bhyve_path = std::env::var("BHYVE_PATH").unwrap_or(defaults.bhyve_path);
        let bhyvectl_path = std::env::var("BHYVECTL_PATH").unwrap_or(defaults.bhyvectl_path);
        let interface_group =
            std::env::var("INTERFACE_GROUP").unwrap_or(defaults.interface_group);

        let poll_interval_ms = parse_var("POLL_INTERVAL_MS", defaults.poll_interval_ms)?;
        let command_timeout_secs = parse_var("COMMAND_TIMEOUT_SECS", defaults.command_timeout_secs)?;
        let stop_timeout_secs = parse_var("STOP_TIMEOUT_SECS", defaults.stop_timeout_secs)?;

        if poll_interval_ms == 0 {
            anyhow::bail!("POLL_INTERVAL_MS 必须大于 0");
        }

        Ok(Self {
            listen_addr,
            database_url,
            log_level,
            sudo,
            bhyve_path,
            bhyvectl_path,
            interface_group,
            poll_interval_ms,
            command_timeout_secs,
            stop_timeout_secs,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

fn parse_var(name: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("环境变量 {} 无效 ({}): {}", name, value, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_shared_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr, constants::DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.interface_group, constants::DEFAULT_INTERFACE_GROUP);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(constants::DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(cfg.stop_timeout(), Duration::from_secs(constants::DEFAULT_STOP_TIMEOUT));
        assert!(cfg.sudo.is_none());
    }
}
