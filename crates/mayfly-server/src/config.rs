//! Configuration loading.
//!
//! Sources, in order: built-in defaults, then an optional TOML file
//! (`/etc/mayfly/config.toml` unless a path is given), then `MAYFLY_*`
//! environment variables. List-valued variables are comma-separated.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mayfly/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// etcd endpoints.
    pub etcd: Vec<String>,

    /// HTTP API port.
    pub port: u16,

    /// The physical interface DHCP packets leave through. Managed virtual
    /// interfaces are bridged to it.
    pub interface: String,

    /// Timeout for establishing the etcd connection.
    pub dial_timeout_secs: u64,

    /// Timeout for individual KV requests; also how long an IP request
    /// waits for the controller before reporting timeout.
    pub request_timeout_secs: u64,

    /// Timeout for a DHCP client's first bind.
    pub client_timeout_secs: u64,

    /// Create one virtual interface per allocation, each carrying a MAC
    /// from the pool. Needed whenever the upstream DHCP server hands out at
    /// most one address per hardware address.
    pub manage_interfaces: bool,

    /// Additionally install each leased address on the uplink. Off unless
    /// another component owns routing and expects the address locally.
    pub assign_interfaces: bool,

    /// When the MAC pool is exhausted, fall back to kernel-generated MACs
    /// instead of leaving the allocation unbound.
    pub dynamic_interfaces: bool,

    /// Static MACs registered with the pool at controller startup.
    pub macs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd: vec!["http://etcd:2379".to_string()],
            port: 8000,
            interface: "eth0".to_string(),
            dial_timeout_secs: 5,
            request_timeout_secs: 10,
            client_timeout_secs: 5,
            manage_interfaces: true,
            assign_interfaces: false,
            dynamic_interfaces: false,
            macs: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the given path (or the default location when present),
    /// apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_list("MAYFLY_ETCD") {
            self.etcd = value;
        }
        env_parse("MAYFLY_PORT", &mut self.port);
        env_string("MAYFLY_INTERFACE", &mut self.interface);
        env_parse("MAYFLY_DIAL_TIMEOUT", &mut self.dial_timeout_secs);
        env_parse("MAYFLY_REQUEST_TIMEOUT", &mut self.request_timeout_secs);
        env_parse("MAYFLY_CLIENT_TIMEOUT", &mut self.client_timeout_secs);
        env_parse("MAYFLY_MANAGE_INTERFACES", &mut self.manage_interfaces);
        env_parse("MAYFLY_ASSIGN_INTERFACES", &mut self.assign_interfaces);
        env_parse("MAYFLY_DYNAMIC_INTERFACES", &mut self.dynamic_interfaces);
        if let Some(value) = env_list("MAYFLY_MACS") {
            self.macs = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.etcd.is_empty() {
            return Err(ConfigError::Invalid("no etcd endpoints".to_string()));
        }
        if self.interface.is_empty() {
            return Err(ConfigError::Invalid("no uplink interface".to_string()));
        }
        for (name, value) in [
            ("dial-timeout", self.dial_timeout_secs),
            ("request-timeout", self.request_timeout_secs),
            ("client-timeout", self.client_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be nonzero")));
            }
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// One line per knob, mirrored at every startup.
    pub fn log(&self) {
        info!("[config]              etcd: {:?}", self.etcd);
        info!("[config]              port: {}", self.port);
        info!("[config]         interface: {}", self.interface);
        info!("[config]      dial-timeout: {}s", self.dial_timeout_secs);
        info!("[config]   request-timeout: {}s", self.request_timeout_secs);
        info!("[config]    client-timeout: {}s", self.client_timeout_secs);
        info!("[config] manage-interfaces: {}", self.manage_interfaces);
        info!("[config] assign-interfaces: {}", self.assign_interfaces);
        info!("[config] dynamic-interfaces: {}", self.dynamic_interfaces);
        info!("[config]     MAC pool size: {}", self.macs.len());
    }
}

fn env_list(name: &str) -> Option<Vec<String>> {
    let value = std::env::var(name).ok()?;
    Some(
        value
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
    )
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    let Ok(value) = std::env::var(name) else {
        return;
    };
    match value.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(var = name, value = %value, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.etcd, vec!["http://etcd:2379"]);
        assert_eq!(config.port, 8000);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.dial_timeout_secs, 5);
        assert_eq!(config.request_timeout_secs, 10);
        assert_eq!(config.client_timeout_secs, 5);
        assert!(config.manage_interfaces);
        assert!(!config.assign_interfaces);
        assert!(!config.dynamic_interfaces);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            interface = "bond0"
            macs = ["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]
            "#,
        )
        .unwrap();
        assert_eq!(config.interface, "bond0");
        assert_eq!(config.macs.len(), 2);
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let config = Config {
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_etcd() {
        let config = Config {
            etcd: Vec::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("MAYFLY_ETCD", "http://a:2379, http://b:2379");
        std::env::set_var("MAYFLY_PORT", "9000");
        std::env::set_var("MAYFLY_MANAGE_INTERFACES", "false");

        let mut config = Config::default();
        config.apply_env();

        std::env::remove_var("MAYFLY_ETCD");
        std::env::remove_var("MAYFLY_PORT");
        std::env::remove_var("MAYFLY_MANAGE_INTERFACES");

        assert_eq!(config.etcd, vec!["http://a:2379", "http://b:2379"]);
        assert_eq!(config.port, 9000);
        assert!(!config.manage_interfaces);
    }
}
