//! Bridge configuration management.
//!
//! Configuration is stored as TOML at `$AQARA_BRIDGE_CONFIG`, or:
//! - Linux: `~/.config/aqara-bridge/bridge.toml`
//! - Windows: `%APPDATA%/aqara-bridge/bridge.toml`

use std::path::{Path, PathBuf};

use aqara_discovery::GatewayConfig;
use serde::{Deserialize, Serialize};

/// Overrides the configuration file location.
pub const CONFIG_ENV: &str = "AQARA_BRIDGE_CONFIG";

/// Bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `"any"`, an IPv4 address, or an interface name.
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Discovery rounds before giving up on missing hubs.
    #[serde(default = "default_discovery_retry")]
    pub discovery_retry: u32,

    /// Seconds between reads of devices that do not report on their own.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

fn default_interface() -> String {
    "any".into()
}

fn default_discovery_retry() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            discovery_retry: default_discovery_retry(),
            poll_interval_secs: default_poll_interval(),
            gateways: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Saves the current configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Hub keys and tokens live here.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("aqara-bridge").join("bridge.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("aqara-bridge")
            .join("bridge.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.interface, "any");
        assert_eq!(config.discovery_retry, 3);
        assert_eq!(config.poll_interval_secs, 30);
        assert!(config.gateways.is_empty());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            discovery_retry = 5

            [[gateways]]
            mac = "78:11:dc:b0:79:17"
            key = "1234567890123456"
            host = "192.168.1.5"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.interface, "any");
        assert_eq!(config.discovery_retry, 5);
        assert_eq!(config.gateways.len(), 1);

        let gw = &config.gateways[0];
        assert_eq!(gw.sid().as_deref(), Some("7811dcb07917"));
        assert_eq!(gw.key.as_deref(), Some("1234567890123456"));
        assert_eq!(gw.port, None);
        assert!(!gw.disable);
    }

    #[test]
    fn sid_alias_is_accepted() {
        let toml_str = r#"
            [[gateways]]
            sid = "7811DCB07917"
            miio_token = "00112233445566778899aabbccddeeff"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gateways[0].sid().as_deref(), Some("7811dcb07917"));
        assert!(config.gateways[0].miio_token.is_some());
    }

    #[test]
    fn missing_file_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("bridge.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 30);
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn config_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bridge.toml");

        let config = Config {
            interface: "eth0".into(),
            poll_interval_secs: 10,
            gateways: vec![GatewayConfig {
                mac: Some("7811dcb07917".into()),
                key: Some("1234567890123456".into()),
                disable: true,
                ..GatewayConfig::default()
            }],
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.interface, "eth0");
        assert_eq!(loaded.poll_interval_secs, 10);
        assert_eq!(loaded.gateways.len(), 1);
        assert!(loaded.gateways[0].disable);
        assert_eq!(loaded.gateways[0].mac.as_deref(), Some("7811dcb07917"));
    }
}
