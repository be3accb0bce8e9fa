//! Client configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_TRUST_SECS;
use crate::{Error, Result};

/// Main configuration for a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_ssl: bool,

    /// Per-request timeout, enforced by the transport.
    pub timeout_ms: u64,

    /// Log in again and resend once when the server rejects the session.
    pub resend_on_invalid_session: bool,

    /// Default trust durations
    pub cache: CacheConfig,

    /// Page and block sizes for bulk transfer
    pub bulk: BulkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub connection_ttl_secs: u64,
    pub database_ttl_secs: u64,
    pub dimension_ttl_secs: u64,
    pub cube_ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    pub export_block_size: usize,
    pub load_block_size: usize,
    /// Page size used when reading attribute values.
    pub attribute_export_block_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7777,
            username: "admin".to_string(),
            password: String::new(),
            use_ssl: false,
            timeout_ms: 30_000,
            resend_on_invalid_session: true,
            cache: CacheConfig::default(),
            bulk: BulkConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            connection_ttl_secs: DEFAULT_TRUST_SECS,
            database_ttl_secs: DEFAULT_TRUST_SECS,
            dimension_ttl_secs: DEFAULT_TRUST_SECS,
            cube_ttl_secs: DEFAULT_TRUST_SECS,
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            export_block_size: 10_000,
            load_block_size: 10_000,
            attribute_export_block_size: 100_000,
        }
    }
}

impl CacheConfig {
    /// Same trust duration for every entity kind.
    pub fn uniform(secs: u64) -> Self {
        Self {
            connection_ttl_secs: secs,
            database_ttl_secs: secs,
            dimension_ttl_secs: secs,
            cube_ttl_secs: secs,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ..Default::default() }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Load config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.bulk.export_block_size == 0
            || self.bulk.load_block_size == 0
            || self.bulk.attribute_export_block_size == 0
        {
            return Err(Error::Config("bulk block sizes must be positive".into()));
        }
        Ok(())
    }

    /// Base URL of the server.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
