//! Configuration file support for ubxflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UBXFLASH_*)
//! 3. Legacy `KEY=VALUE` file (`--legacy-config`)
//! 4. `--config` file, or the local config file (./ubxflash.toml)
//! 5. Global config file (~/.config/ubxflash/config.toml)
//!
//! Layers 1 and 2 are resolved by clap; this module merges the rest.

use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "ubxflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Operating baud rate of the module.
    pub baud: Option<u32>,
}

/// Firmware update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Module type (e.g., "NINA-W15X").
    pub module: Option<String>,
    /// Firmware release to install (e.g., "3.1.0").
    pub fw_version: Option<String>,
    /// Baud rate used for the image transfer.
    pub flash_baud: Option<u32>,
    /// Root directory of the firmware releases.
    pub firmware_dir: Option<PathBuf>,
    /// Switch back to the operating baud rate after an upgrade.
    pub restore_baud: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse TOML config {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ubxflash").map(|dirs| {
            dirs.config_dir()
                .to_path_buf()
        })
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Set values win.
    fn merge(&mut self, other: Self) {
        let Self { connection, update } = other;

        if connection
            .port
            .is_some()
        {
            self.connection.port = connection.port;
        }
        if connection
            .baud
            .is_some()
        {
            self.connection.baud = connection.baud;
        }

        if update
            .module
            .is_some()
        {
            self.update.module = update.module;
        }
        if update
            .fw_version
            .is_some()
        {
            self.update.fw_version = update.fw_version;
        }
        if update
            .flash_baud
            .is_some()
        {
            self.update.flash_baud = update.flash_baud;
        }
        if update
            .firmware_dir
            .is_some()
        {
            self.update.firmware_dir = update.firmware_dir;
        }
        if update
            .restore_baud
            .is_some()
        {
            self.update.restore_baud = update.restore_baud;
        }
    }

    /// Overlay the values of a legacy configuration file.
    pub fn apply_legacy(&mut self, legacy: LegacyConfig) {
        self.merge(Self {
            connection: ConnectionConfig {
                port: legacy.port,
                baud: legacy.baud,
            },
            update: UpdateConfig {
                module: legacy.module,
                fw_version: legacy.fw_version,
                ..UpdateConfig::default()
            },
        });
    }

    /// Remember `port` in the local configuration file.
    pub fn remember_port(&mut self, port: &str) -> Result<()> {
        self.connection.port = Some(port.to_string());

        let path = Path::new(LOCAL_CONFIG_FILE);
        let mut local = Self::load_from_file(path).unwrap_or_default();
        local.connection.port = Some(port.to_string());

        let content = toml::to_string_pretty(&local)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Saved port {port} to {}", path.display());

        Ok(())
    }
}

/// Flat `KEY=VALUE` configuration file.
///
/// ```text
/// # NINA-W15X on the first USB adapter
/// MODULE=NINA-W15X
/// FW_VERSION=3.1.0
/// COMPORT=/dev/ttyUSB0
/// BAUDRATE=115200
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyConfig {
    /// `MODULE`
    pub module: Option<String>,
    /// `FW_VERSION`
    pub fw_version: Option<String>,
    /// `COMPORT`
    pub port: Option<String>,
    /// `BAUDRATE`
    pub baud: Option<u32>,
}

impl LegacyConfig {
    /// Read and parse a legacy configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Configuration file not found at {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid configuration {}", path.display()))
    }

    /// Parse `KEY=VALUE` lines. `#` starts a comment line; values may be quoted.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for (number, line) in content
            .lines()
            .enumerate()
        {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                bail!("line {}: expected KEY=VALUE", number + 1);
            };
            let value = value
                .trim()
                .trim_matches('"')
                .to_string();

            match key.trim() {
                "MODULE" => config.module = Some(value),
                "FW_VERSION" => config.fw_version = Some(value),
                "COMPORT" => config.port = Some(value),
                "BAUDRATE" => {
                    let baud = value
                        .parse()
                        .with_context(|| format!("line {}: invalid BAUDRATE {value:?}", number + 1))?;
                    config.baud = Some(baud);
                },
                other => debug!("Ignoring unknown key {other}"),
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(
            config
                .connection
                .port
                .is_none()
        );
        assert!(
            config
                .update
                .module
                .is_none()
        );
        assert!(
            config
                .update
                .restore_baud
                .is_none()
        );
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.connection.baud = Some(115200);
        base.update.module = Some("NINA-W13X".to_string());

        let mut other = Config::default();
        other.connection.baud = Some(230400);
        other.update.fw_version = Some("3.1.0".to_string());

        base.merge(other);

        assert_eq!(base.connection.baud, Some(230400));
        assert_eq!(base.update.module.as_deref(), Some("NINA-W13X"));
        assert_eq!(base.update.fw_version.as_deref(), Some("3.1.0"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.update.restore_baud = Some(false);

        base.merge(Config::default());

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.update.restore_baud, Some(false));
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyUSB0"
baud = 115200

[update]
module = "NINA-W15X"
fw_version = "3.1.0"
flash_baud = 921600
firmware_dir = "Firmwares"
restore_baud = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.update.module.as_deref(), Some("NINA-W15X"));
        assert_eq!(config.update.fw_version.as_deref(), Some("3.1.0"));
        assert_eq!(config.update.flash_baud, Some(921600));
        assert_eq!(
            config.update.firmware_dir.as_deref(),
            Some(Path::new("Firmwares"))
        );
        assert_eq!(config.update.restore_baud, Some(false));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.update.flash_baud.is_none());
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[update]\nmodule = \"NINA-B22X\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.update.module.as_deref(), Some("NINA-B22X"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.update.module.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.port.is_none());
    }

    #[test]
    fn test_global_config_path_names_app() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("ubxflash"));
            assert!(p.ends_with("config.toml"));
        }
    }

    // ---- Legacy KEY=VALUE ----

    #[test]
    fn test_legacy_parse() {
        let legacy = LegacyConfig::parse(
            "# flashing setup\n\nMODULE=NINA-W15X\nFW_VERSION = \"3.1.0\"\nCOMPORT=COM3\nBAUDRATE=115200\n",
        )
        .unwrap();
        assert_eq!(
            legacy,
            LegacyConfig {
                module: Some("NINA-W15X".into()),
                fw_version: Some("3.1.0".into()),
                port: Some("COM3".into()),
                baud: Some(115200),
            }
        );
    }

    #[test]
    fn test_legacy_value_may_contain_equals() {
        let legacy = LegacyConfig::parse("COMPORT=/dev/serial/by-id/a=b").unwrap();
        assert_eq!(legacy.port.as_deref(), Some("/dev/serial/by-id/a=b"));
    }

    #[test]
    fn test_legacy_rejects_bad_lines() {
        assert!(LegacyConfig::parse("MODULE").is_err());
        assert!(LegacyConfig::parse("BAUDRATE=fast").is_err());
    }

    #[test]
    fn test_legacy_missing_file() {
        let err = LegacyConfig::from_file(Path::new("/nonexistent/config.txt")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_apply_legacy_overrides_toml() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyUSB0".into());
        config.update.flash_baud = Some(460800);

        config.apply_legacy(LegacyConfig {
            port: Some("/dev/ttyACM1".into()),
            ..LegacyConfig::default()
        });

        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(config.update.flash_baud, Some(460800));
    }
}
