//! Load config from file and environment.

use peerlink_core::{ConnectionType, ManagerConfig, ManagerMode};
use serde::Deserialize;
use std::path::PathBuf;

/// Demo configuration. File: ~/.config/peerlink/config.toml or /etc/peerlink/config.toml.
/// Env overrides: PEERLINK_SERVICE_TYPE, PEERLINK_SUB_SERVICE, PEERLINK_DISPLAY_NAME,
/// PEERLINK_PUMP_INTERVAL_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery channel shared by both managers (default "peerlink").
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub sub_service: String,
    /// Base display name; the managers append "-local" and "-remote".
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// How often the loopback hub is pumped (default 50 ms).
    #[serde(default = "default_pump_interval_ms")]
    pub pump_interval_ms: u64,
}

fn default_service_type() -> String {
    "peerlink".to_string()
}
fn default_display_name() -> String {
    "demo".to_string()
}
fn default_pump_interval_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            sub_service: String::new(),
            display_name: default_display_name(),
            connection_type: ConnectionType::default(),
            pump_interval_ms: default_pump_interval_ms(),
        }
    }
}

impl Config {
    /// Manager configuration for one side of the demo.
    pub fn manager(&self, side: &str, mode: ManagerMode) -> ManagerConfig {
        ManagerConfig::new(&self.service_type, &format!("{}-{side}", self.display_name))
            .with_sub_service(&self.sub_service)
            .with_connection_type(self.connection_type)
            .with_manager_mode(mode)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PEERLINK_SERVICE_TYPE") {
        c.service_type = s;
    }
    if let Ok(s) = std::env::var("PEERLINK_SUB_SERVICE") {
        c.sub_service = s;
    }
    if let Ok(s) = std::env::var("PEERLINK_DISPLAY_NAME") {
        c.display_name = s;
    }
    if let Ok(s) = std::env::var("PEERLINK_PUMP_INTERVAL_MS") {
        if let Ok(ms) = s.parse::<u64>() {
            c.pump_interval_ms = ms.max(1);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: Config = toml::from_str("sub_service = \"chat\"\nconnection_type = \"custom\"").unwrap();
        assert_eq!(c.service_type, "peerlink");
        assert_eq!(c.sub_service, "chat");
        assert_eq!(c.connection_type, ConnectionType::Custom);
        assert_eq!(c.pump_interval_ms, 50);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
    }

    #[test]
    fn manager_config_per_side() {
        let c = Config::default();
        let m = c.manager("local", ManagerMode::Slave);
        assert_eq!(m.display_name, "demo-local");
        assert_eq!(m.manager_mode, ManagerMode::Slave);
        assert_eq!(m.service_type, "peerlink");
    }
}
