//! Platform configuration with TOML file support.

use crate::access::Capabilities;
use crate::escrow::{EscrowConfig, EscrowError};
use crate::identity::{Did, DidError};
use crate::ledger::{LedgerConfig, LedgerError};
use crate::logging::LogFormat;
use crate::marketplace::{MarketError, MarketplaceConfig};
use crate::relay::{RelayConfig, RelayError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid role DID '{did}': {source}")]
    InvalidRole { did: String, source: DidError },

    #[error("Invalid log format '{0}', expected 'human' or 'json'")]
    InvalidLogFormat(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Marketplace(#[from] MarketError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Role assignments, as DID strings
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolesConfig {
    pub admins: Vec<String>,
    pub resolvers: Vec<String>,
    pub signers: Vec<String>,
    pub operators: Vec<String>,
}

impl RolesConfig {
    pub fn to_capabilities(&self) -> Result<Capabilities, ConfigError> {
        let parse = |s: &String| {
            Did::parse(s).map_err(|source| ConfigError::InvalidRole {
                did: s.clone(),
                source,
            })
        };

        let mut caps = Capabilities::new();
        for did in &self.admins {
            caps = caps.with_admin(parse(did)?);
        }
        for did in &self.resolvers {
            caps = caps.with_resolver(parse(did)?);
        }
        for did in &self.signers {
            caps = caps.with_signer(parse(did)?);
        }
        for did in &self.operators {
            caps = caps.with_operator(parse(did)?);
        }
        Ok(caps)
    }
}

/// Configuration for a platform process.
///
/// Loaded from a TOML file via [`PlatformConfig::from_toml_file`] or built
/// programmatically for tests. Every section falls back to its defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Directory holding the sled database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log format: "human" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter, e.g. "info" or "debug,freight_escrow=trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub escrow: EscrowConfig,

    #[serde(default)]
    pub marketplace: MarketplaceConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub roles: RolesConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./freight_data")
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PlatformConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ledger.validate()?;
        self.escrow.validate()?;
        self.marketplace.validate()?;
        self.relay.validate()?;
        self.log_format()?;
        self.roles.to_capabilities()?;
        Ok(())
    }

    pub fn log_format(&self) -> Result<LogFormat, ConfigError> {
        match self.log_format.to_ascii_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::InvalidLogFormat(other.to_string())),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            ledger: LedgerConfig::default(),
            escrow: EscrowConfig::default(),
            marketplace: MarketplaceConfig::default(),
            relay: RelayConfig::default(),
            roles: RolesConfig::default(),
        }
    }
}
