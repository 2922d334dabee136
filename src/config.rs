use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cert::params::MAX_VALIDITY_DAYS;
use crate::error::{CaError, Result};
use crate::key::KeyAlgorithm;

/// Longest thisUpdate to nextUpdate distance accepted for CRLs.
pub const MAX_CRL_VALIDITY_DAYS: u32 = 3650;

/// Runtime settings for the authority and its REST server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Algorithm for keys generated for root and intermediate certificates.
    pub key_algorithm: KeyAlgorithm,
    /// Serial numbers tried per issuance before giving up.
    pub max_serial_attempts: u32,
    /// Distance between thisUpdate and nextUpdate of generated CRLs.
    pub crl_validity_days: u32,
    /// Upper bound on any certificate lifetime, if set.
    pub max_validity_days: Option<u32>,
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    pub log_filter: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

/// Where certificates, templates, CA keys and the audit log live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Unset keeps all state in memory.
    pub data_dir: Option<PathBuf>,
    /// Environment variable holding the passphrase that protects CA keys.
    pub passphrase_env: String,
    /// PBKDF2-HMAC-SHA256 rounds used to derive the key vault master key.
    pub kdf_iterations: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            passphrase_env: "PKI_AUTHORITY_PASSPHRASE".to_string(),
            kdf_iterations: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8443)),
        }
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            max_serial_attempts: 8,
            crl_validity_days: 7,
            max_validity_days: None,
            log_filter: "info".to_string(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl AuthorityConfig {
    /// Reads a TOML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| CaError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CaError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_serial_attempts == 0 {
            return Err(CaError::Config("max_serial_attempts must be at least 1".into()));
        }
        if !(1..=MAX_CRL_VALIDITY_DAYS).contains(&self.crl_validity_days) {
            return Err(CaError::Config(format!(
                "crl_validity_days must be between 1 and {MAX_CRL_VALIDITY_DAYS}"
            )));
        }
        if let Some(days) = self.max_validity_days {
            if !(1..=MAX_VALIDITY_DAYS).contains(&days) {
                return Err(CaError::Config(format!(
                    "max_validity_days must be between 1 and {MAX_VALIDITY_DAYS}"
                )));
            }
        }
        if self.storage.data_dir.is_some() && self.storage.kdf_iterations < 1_000 {
            return Err(CaError::Config("storage.kdf_iterations must be at least 1000".into()));
        }
        if self.storage.passphrase_env.trim().is_empty() {
            return Err(CaError::Config("storage.passphrase_env must not be empty".into()));
        }
        if self.log_filter.trim().is_empty() {
            return Err(CaError::Config("log_filter must not be empty".into()));
        }
        Ok(())
    }
}
