//! Controller configuration: loaded once at startup, schema-checked and
//! validated. Invalid configuration is a fatal initialization error.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Directory holding installed engine versions, relative to the working
/// directory.
pub const ENGINES_DIR: &str = "engines";

/// Directory holding per-battle instance directories.
pub const INSTANCES_DIR: &str = "instances";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The full configuration surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Lobby hostname.
    pub tachyon_server: String,
    /// Override for the lobby port; the scheme default is used otherwise.
    #[serde(default)]
    pub tachyon_server_port: Option<u16>,
    /// TLS selector; defaults to true except when the host is `localhost`.
    #[serde(default)]
    pub use_secure_connection: Option<bool>,
    pub auth_client_id: String,
    pub auth_client_secret: String,
    /// IPv4 address advertised to joining clients.
    #[serde(rename = "hostingIP")]
    pub hosting_ip: String,
    /// Bind address for the engine's battle socket.
    #[serde(default = "default_engine_bind_ip")]
    pub engine_bind_ip: String,
    #[serde(default = "default_max_reconnect_delay_seconds")]
    pub max_reconnect_delay_seconds: u64,
    /// Extra key/value settings merged into every per-battle settings file.
    #[serde(default)]
    pub engine_settings: BTreeMap<String, String>,
    #[serde(default = "default_max_battles")]
    pub max_battles: usize,
    #[serde(default = "default_max_updates_subscription_age_seconds")]
    pub max_updates_subscription_age_seconds: u64,
    #[serde(default = "default_engine_start_port")]
    pub engine_start_port: u16,
    #[serde(default = "default_engine_autohost_start_port")]
    pub engine_autohost_start_port: u16,
    #[serde(default = "default_max_ports_used")]
    pub max_ports_used: u16,
    #[serde(default = "default_engine_install_timeout_seconds")]
    pub engine_install_timeout_seconds: u64,
    #[serde(default = "default_engine_download_max_attempts")]
    pub engine_download_max_attempts: u32,
    #[serde(default = "default_engine_download_retry_backoff_base_ms")]
    pub engine_download_retry_backoff_base_ms: u64,
    #[serde(default = "default_engine_cdn_base_url")]
    pub engine_cdn_base_url: String,
    #[serde(default = "default_max_game_duration_seconds")]
    pub max_game_duration_seconds: u64,
}

fn default_engine_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_max_reconnect_delay_seconds() -> u64 {
    30
}

fn default_max_battles() -> usize {
    50
}

fn default_max_updates_subscription_age_seconds() -> u64 {
    600
}

fn default_engine_start_port() -> u16 {
    20000
}

fn default_engine_autohost_start_port() -> u16 {
    22000
}

fn default_max_ports_used() -> u16 {
    1000
}

fn default_engine_install_timeout_seconds() -> u64 {
    600
}

fn default_engine_download_max_attempts() -> u32 {
    3
}

fn default_engine_download_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_engine_cdn_base_url() -> String {
    "https://files-cdn.beyondallreason.dev".to_string()
}

fn default_max_game_duration_seconds() -> u64 {
    8 * 60 * 60
}

impl Config {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses an in-memory JSON configuration (used by tests).
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hosting_ip.parse::<Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "hostingIP {:?} is not an IPv4 address",
                self.hosting_ip
            )));
        }
        if self.engine_bind_ip.parse::<Ipv4Addr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "engineBindIP {:?} is not an IPv4 address",
                self.engine_bind_ip
            )));
        }
        if self.max_ports_used == 0 {
            return Err(ConfigError::Invalid(
                "maxPortsUsed must be at least 1".to_string(),
            ));
        }
        let battle_range = port_range(self.engine_start_port, self.max_ports_used)?;
        let autohost_range = port_range(self.engine_autohost_start_port, self.max_ports_used)?;
        if battle_range.0 < autohost_range.1 && autohost_range.0 < battle_range.1 {
            return Err(ConfigError::Invalid(format!(
                "engine port range {}..{} overlaps autohost port range {}..{}",
                battle_range.0, battle_range.1, autohost_range.0, autohost_range.1
            )));
        }
        if self.engine_download_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "engineDownloadMaxAttempts must be at least 1".to_string(),
            ));
        }
        if self.engine_install_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "engineInstallTimeoutSeconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the lobby connection uses TLS.
    pub fn secure_connection(&self) -> bool {
        self.use_secure_connection
            .unwrap_or(self.tachyon_server != "localhost")
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_seconds)
    }

    pub fn max_updates_subscription_age(&self) -> Duration {
        Duration::from_secs(self.max_updates_subscription_age_seconds)
    }

    pub fn engine_install_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_install_timeout_seconds)
    }

    pub fn engine_download_retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.engine_download_retry_backoff_base_ms)
    }

    pub fn max_game_duration(&self) -> Duration {
        Duration::from_secs(self.max_game_duration_seconds)
    }
}

fn port_range(start: u16, count: u16) -> Result<(u32, u32), ConfigError> {
    let end = start as u32 + count as u32;
    if end > u16::MAX as u32 + 1 {
        return Err(ConfigError::Invalid(format!(
            "port range starting at {start} with {count} ports exceeds 65535"
        )));
    }
    Ok((start as u32, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "tachyonServer": "lobby.example.com",
            "authClientId": "autohost-1",
            "authClientSecret": "secret",
            "hostingIP": "203.0.113.7",
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = Config::from_json(&minimal().to_string()).unwrap();
        assert_eq!(cfg.engine_bind_ip, "0.0.0.0");
        assert_eq!(cfg.max_battles, 50);
        assert_eq!(cfg.engine_start_port, 20000);
        assert_eq!(cfg.engine_autohost_start_port, 22000);
        assert_eq!(cfg.max_ports_used, 1000);
        assert_eq!(cfg.max_game_duration_seconds, 28800);
        assert_eq!(cfg.engine_download_max_attempts, 3);
        assert!(cfg.secure_connection());
    }

    #[test]
    fn localhost_defaults_to_plain_connection() {
        let mut raw = minimal();
        raw["tachyonServer"] = serde_json::json!("localhost");
        let cfg = Config::from_json(&raw.to_string()).unwrap();
        assert!(!cfg.secure_connection());

        raw["useSecureConnection"] = serde_json::json!(true);
        let cfg = Config::from_json(&raw.to_string()).unwrap();
        assert!(cfg.secure_connection());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut raw = minimal();
        raw.as_object_mut().unwrap().remove("hostingIP");
        assert!(Config::from_json(&raw.to_string()).is_err());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut raw = minimal();
        raw["notAnOption"] = serde_json::json!(1);
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Schema(_))
        ));
    }

    #[test]
    fn bad_hosting_ip_is_rejected() {
        let mut raw = minimal();
        raw["hostingIP"] = serde_json::json!("not-an-ip");
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn overlapping_port_ranges_are_rejected() {
        let mut raw = minimal();
        raw["engineStartPort"] = serde_json::json!(20000);
        raw["engineAutohostStartPort"] = serde_json::json!(20500);
        raw["maxPortsUsed"] = serde_json::json!(1000);
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn port_range_overflow_is_rejected() {
        let mut raw = minimal();
        raw["engineAutohostStartPort"] = serde_json::json!(65000);
        raw["maxPortsUsed"] = serde_json::json!(1000);
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_download_attempts_rejected() {
        let mut raw = minimal();
        raw["engineDownloadMaxAttempts"] = serde_json::json!(0);
        assert!(matches!(
            Config::from_json(&raw.to_string()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
