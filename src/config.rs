use conduit::storage::EventLogConfig;
use conduit::transport::{ClientTimeouts, EnvPolicy, TransportConfig};
use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub event_log: EventLogConfig,
    pub rpc: RpcConfig,
    pub env: EnvConfig,
    pub servers: BTreeMap<String, TransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub request_timeout_ms: u64,
    pub health_check_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        let timeouts = ClientTimeouts::default();
        Self {
            request_timeout_ms: timeouts.request_ms,
            health_check_timeout_ms: timeouts.health_check_ms,
        }
    }
}

impl RpcConfig {
    pub fn timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            request_ms: self.request_timeout_ms,
            health_check_ms: self.health_check_timeout_ms,
        }
    }
}

/// Adjustments to the built-in deny-list for spawned servers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub deny: Vec<String>,
    pub allow: Vec<String>,
}

impl EnvConfig {
    pub fn policy(&self) -> EnvPolicy {
        EnvPolicy::default()
            .with_denied(self.deny.iter().cloned())
            .with_allowed(self.allow.iter().cloned())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            event_log: EventLogConfig::default(),
            rpc: RpcConfig::default(),
            env: EnvConfig::default(),
            servers: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config = Self::parse(&content)?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, server) in &self.servers {
            server.validate(name)?;
        }
        if self.rpc.request_timeout_ms == 0 || self.rpc.health_check_timeout_ms == 0 {
            bail!("rpc timeouts must be greater than zero");
        }
        Ok(())
    }

    pub fn server(&self, name: &str) -> Result<&TransportConfig> {
        match self.servers.get(name) {
            Some(server) => Ok(server),
            None => {
                let known: Vec<&str> = self.servers.keys().map(String::as_str).collect();
                bail!("unknown server '{}' (configured: {})", name, known.join(", "))
            }
        }
    }
}
