//! Enforcer configuration
//!
//! Loaded from a JSON file; every field has a default so a missing file or
//! a partial one still yields a usable configuration.
//!
//! # Environment Variables
//!
//! - `ENFORCER_RESTORE_COMMAND`: path to the `iptables-restore` binary,
//!   overriding both the file and the per-IP-version default.
//! - `ENFORCER_IPTABLES_COMMAND`: same for the single-rule `iptables` binary.
//!
//! Both exist for packagers with non-standard paths and for tests that
//! point the enforcer at mock tools.

use crate::core::error::{Error, Result};
use crate::core::passthrough::{IPTABLES_CMD_V4, IPTABLES_CMD_V6};
use crate::core::restore::{RESTORE_CMD_V4, RESTORE_CMD_V6};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const RESTORE_COMMAND_ENV: &str = "ENFORCER_RESTORE_COMMAND";
pub const IPTABLES_COMMAND_ENV: &str = "ENFORCER_IPTABLES_COMMAND";

/// Default mark for the enforcer's own connections.
pub const DEFAULT_CONN_MARK: u32 = 0xEEEE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("ipv4"),
            Self::V6 => f.write_str("ipv6"),
        }
    }
}

/// Complete enforcer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Which tables are batched and which tools program them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub ip_version: IpVersion,
    /// Tables applied atomically on commit. Empty means every table is
    /// programmed rule by rule.
    #[serde(default = "default_batch_tables")]
    pub batch_tables: Vec<String>,
    #[serde(default)]
    pub restore_command: Option<String>,
    #[serde(default)]
    pub iptables_command: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::V4,
            batch_tables: default_batch_tables(),
            restore_command: None,
            iptables_command: None,
        }
    }
}

impl ProviderConfig {
    pub fn for_tables(ip_version: IpVersion, batch_tables: &[&str]) -> Self {
        Self {
            ip_version,
            batch_tables: batch_tables.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// The restore tool to run: environment, then file, then the default for the IP version.
    pub fn restore_command(&self) -> String {
        let default = match self.ip_version {
            IpVersion::V4 => RESTORE_CMD_V4,
            IpVersion::V6 => RESTORE_CMD_V6,
        };
        resolve_command(RESTORE_COMMAND_ENV, self.restore_command.as_deref(), default)
    }

    /// The single-rule tool to run, resolved like [`Self::restore_command`].
    pub fn iptables_command(&self) -> String {
        let default = match self.ip_version {
            IpVersion::V4 => IPTABLES_CMD_V4,
            IpVersion::V6 => IPTABLES_CMD_V6,
        };
        resolve_command(IPTABLES_COMMAND_ENV, self.iptables_command.as_deref(), default)
    }
}

/// Transparent proxy socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_mark")]
    pub mark: u32,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_size")]
    pub port_range_size: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            mark: DEFAULT_CONN_MARK,
            port_range_start: default_port_range_start(),
            port_range_size: default_port_range_size(),
        }
    }
}

fn default_batch_tables() -> Vec<String> {
    vec!["mangle".to_string(), "nat".to_string()]
}

fn default_mark() -> u32 {
    DEFAULT_CONN_MARK
}

fn default_port_range_start() -> u16 {
    5000
}

fn default_port_range_size() -> u16 {
    100
}

fn resolve_command(env_var: &str, configured: Option<&str>, default: &str) -> String {
    if let Ok(cmd) = std::env::var(env_var)
        && !cmd.is_empty()
    {
        return cmd;
    }
    configured.unwrap_or(default).to_string()
}

/// Loads the configuration from `path`, or returns defaults if the file does not exist.
///
/// # Errors
///
/// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
pub async fn load_config(path: impl AsRef<Path>) -> Result<EnforcerConfig> {
    let path = path.as_ref();
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(EnforcerConfig::default()),
        Err(e) => return Err(Error::Config(format!("cannot read {}: {e}", path.display()))),
    };
    serde_json::from_str(&json)
        .map_err(|e| Error::Config(format!("invalid {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EnforcerConfig::default();
        assert_eq!(config.provider.ip_version, IpVersion::V4);
        assert_eq!(config.provider.batch_tables, ["mangle", "nat"]);
        assert_eq!(config.proxy.mark, 0xEEEE);
        assert_eq!(config.proxy.port_range_start, 5000);
        assert_eq!(config.proxy.port_range_size, 100);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{"provider": {"ip_version": "v6", "batch_tables": []}}"#;
        let config: EnforcerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider.ip_version, IpVersion::V6);
        assert!(config.provider.batch_tables.is_empty());
        assert_eq!(config.proxy, ProxyConfig::default());
    }

    #[test]
    fn test_configured_commands_win_over_version_defaults() {
        let mut provider = ProviderConfig::for_tables(IpVersion::V6, &["nat"]);
        if std::env::var(RESTORE_COMMAND_ENV).is_err() {
            assert_eq!(provider.restore_command(), "ip6tables-restore");
            provider.restore_command = Some("/usr/sbin/ip6tables-legacy-restore".to_string());
            assert_eq!(provider.restore_command(), "/usr/sbin/ip6tables-legacy-restore");
        }
        if std::env::var(IPTABLES_COMMAND_ENV).is_err() {
            assert_eq!(provider.iptables_command(), "ip6tables");
        }
    }

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let config = load_config("/nonexistent/enforcer.json").await.unwrap();
        assert_eq!(config, EnforcerConfig::default());
    }
}
