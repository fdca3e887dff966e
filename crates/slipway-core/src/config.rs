//! slipway.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::types::Environment;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },
    #[error("invalid port range for {environment}: {start}-{end}")]
    PortRange {
        environment: Environment,
        start: u16,
        end: u16,
    },
    #[error("port ranges for {a} and {b} overlap")]
    OverlappingRanges { a: Environment, b: Environment },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipwayConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ports: PortsConfig,
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub proxy: ProxyConfig,
    pub promotion: PromotionConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Host used to build preview addresses for non-active slots.
    pub public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7400".to_string(),
            public_host: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: PathBuf,
    pub mirror_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/var/lib/slipway/slipway.redb"),
            mirror_dir: PathBuf::from("/var/lib/slipway/mirror"),
        }
    }
}

/// Inclusive port range reserved for one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// First even port in the range; blue slots always land on even ports.
    pub fn aligned_start(&self) -> u16 {
        if self.start % 2 == 0 {
            self.start
        } else {
            self.start.saturating_add(1)
        }
    }

    /// Candidate base ports: every even port whose odd sibling also fits.
    pub fn base_ports(&self) -> impl Iterator<Item = u16> {
        (self.aligned_start()..self.end).step_by(2)
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub production: PortRange,
    pub staging: PortRange,
    pub preview: PortRange,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            production: PortRange::new(4000, 4499),
            staging: PortRange::new(3000, 3499),
            preview: PortRange::new(5000, 5999),
        }
    }
}

impl PortsConfig {
    pub fn range(&self, environment: Environment) -> PortRange {
        match environment {
            Environment::Production => self.production,
            Environment::Staging => self.staging,
            Environment::Preview => self.preview,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container runtime CLI.
    pub binary: String,
    pub command_timeout: String,
    /// Port the application listens on inside the container.
    pub internal_port: u16,
    pub cpus: String,
    pub memory: String,
    /// Root directory for synchronized per-slot env files.
    pub env_dir: PathBuf,
    pub network: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            command_timeout: "120s".to_string(),
            internal_port: 3000,
            cpus: "1.0".to_string(),
            memory: "512m".to_string(),
            env_dir: PathBuf::from("/var/lib/slipway/env"),
            network: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// HTTP path probed on deployed applications.
    pub path: String,
    /// Total budget for a deploy's health verification.
    pub timeout: String,
    /// Pause between verification rounds.
    pub interval: String,
    /// Timeout for each individual probe.
    pub probe_timeout: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            timeout: "60s".to_string(),
            interval: "5s".to_string(),
            probe_timeout: "3s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub binary: String,
    /// Main Caddyfile that imports `sites_dir/*.caddy`.
    pub main_config: PathBuf,
    pub sites_dir: PathBuf,
    pub base_domain: String,
    /// Overrides `{binary} reload --config {main_config}` when set.
    pub reload_command: Option<Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary: "caddy".to_string(),
            main_config: PathBuf::from("/etc/caddy/Caddyfile"),
            sites_dir: PathBuf::from("/etc/caddy/sites"),
            base_domain: "apps.localhost".to_string(),
            reload_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    pub grace_period: String,
    /// Age after which an in-flight registry lease is considered abandoned.
    pub lease_ttl: String,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            grace_period: "48h".to_string(),
            lease_ttl: "15m".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub prefix: String,
    pub rate_limit_requests: u32,
    pub rate_limit_window: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            prefix: "slw".to_string(),
            rate_limit_requests: 60,
            rate_limit_window: "60s".to_string(),
        }
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("runtime.command_timeout", &self.command_timeout)
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("health.timeout", &self.timeout)
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("health.interval", &self.interval)
    }

    pub fn probe_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("health.probe_timeout", &self.probe_timeout)
    }
}

impl PromotionConfig {
    pub fn grace_period(&self) -> Result<Duration, ConfigError> {
        duration_field("promotion.grace_period", &self.grace_period)
    }

    pub fn lease_ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("promotion.lease_ttl", &self.lease_ttl)
    }
}

impl AuthConfig {
    pub fn rate_limit_window(&self) -> Result<Duration, ConfigError> {
        duration_field("auth.rate_limit_window", &self.rate_limit_window)
    }
}

impl SlipwayConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SlipwayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every duration and port range up front so the daemon fails at boot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.runtime.command_timeout()?;
        self.health.timeout()?;
        self.health.interval()?;
        self.health.probe_timeout()?;
        self.promotion.grace_period()?;
        self.promotion.lease_ttl()?;
        self.auth.rate_limit_window()?;

        for env in Environment::ALL {
            let range = self.ports.range(env);
            if range.base_ports().next().is_none() {
                return Err(ConfigError::PortRange {
                    environment: env,
                    start: range.start,
                    end: range.end,
                });
            }
        }
        for (i, a) in Environment::ALL.iter().enumerate() {
            for b in &Environment::ALL[i + 1..] {
                if self.ports.range(*a).overlaps(&self.ports.range(*b)) {
                    return Err(ConfigError::OverlappingRanges { a: *a, b: *b });
                }
            }
        }
        if self.auth.prefix.is_empty() || self.auth.prefix.contains('_') {
            return Err(ConfigError::Invalid(
                "auth.prefix must be non-empty and must not contain '_'".to_string(),
            ));
        }
        if self.auth.rate_limit_requests == 0 {
            return Err(ConfigError::Invalid(
                "auth.rate_limit_requests must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SlipwayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.promotion.grace_period().unwrap(), Duration::from_secs(48 * 3600));
        assert_eq!(config.health.timeout().unwrap(), Duration::from_secs(60));
        assert_eq!(config.health.interval().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn parse_partial_file() {
        let toml_str = r#"
[server]
public_host = "deploy.example.com"

[ports.production]
start = 4101
end = 4199

[health]
timeout = "90s"
"#;
        let config: SlipwayConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.public_host, "deploy.example.com");
        assert_eq!(config.server.listen, "0.0.0.0:7400");
        assert_eq!(config.ports.production.aligned_start(), 4102);
        assert_eq!(config.health.timeout().unwrap(), Duration::from_secs(90));
        assert_eq!(config.runtime.binary, "podman");
    }

    #[test]
    fn base_ports_keep_pairs_inside_range() {
        let range = PortRange::new(4000, 4005);
        let bases: Vec<u16> = range.base_ports().collect();
        assert_eq!(bases, vec![4000, 4002, 4004]);

        let odd_end = PortRange::new(4001, 4004);
        let bases: Vec<u16> = odd_end.base_ports().collect();
        assert_eq!(bases, vec![4002]);
    }

    #[test]
    fn rejects_bad_duration() {
        let mut config = SlipwayConfig::default();
        config.health.interval = "often".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Duration { field: "health.interval", .. })
        ));
    }

    #[test]
    fn rejects_overlapping_ranges() {
        let mut config = SlipwayConfig::default();
        config.ports.staging = PortRange::new(4400, 4600);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OverlappingRanges { .. })
        ));
    }

    #[test]
    fn from_file_roundtrips_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slipway.toml");
        std::fs::write(&path, SlipwayConfig::default().to_toml_string().unwrap()).unwrap();
        let config = SlipwayConfig::from_file(&path).unwrap();
        assert_eq!(config.auth.prefix, "slw");
    }
}
