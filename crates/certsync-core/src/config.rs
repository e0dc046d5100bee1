//! Configuration types for certsync
//!
//! This module defines all configuration structures used throughout the crate.
//! Every field has a default so an empty JSON object is a valid config; hosts
//! usually fill `namespace.host` and `crypto.aes_key` and leave the rest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::crypto::EnvelopeCrypto;

/// Main certsync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Namespace allocation settings
    #[serde(default)]
    pub namespace: NamespaceConfig,

    /// Envelope encryption settings
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Record synchronizer settings
    #[serde(default)]
    pub records: PollConfig,

    /// Entity grouper settings
    #[serde(default)]
    pub groups: GroupConfig,

    /// Window in which a repeated decrypt failure is logged only once
    #[serde(default = "default_decrypt_error_log_interval_secs")]
    pub decrypt_error_log_interval_secs: u64,
}

impl SyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.namespace.validate()?;
        self.crypto.validate()?;
        self.records.validate("records")?;
        self.groups.validate()?;

        if self.decrypt_error_log_interval_secs == 0 {
            return Err(crate::Error::validation(
                "decrypt_error_log_interval_secs must be > 0",
            ));
        }

        Ok(())
    }

    /// Rate-limit window for decrypt failure logging
    pub fn decrypt_error_log_interval(&self) -> Duration {
        Duration::from_secs(self.decrypt_error_log_interval_secs)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: NamespaceConfig::default(),
            crypto: CryptoConfig::default(),
            records: PollConfig::default(),
            groups: GroupConfig::default(),
            decrypt_error_log_interval_secs: default_decrypt_error_log_interval_secs(),
        }
    }
}

/// Namespace allocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Local host identity; scopes the stat key and generated prefixes
    #[serde(default = "default_host")]
    pub host: String,

    /// Fixed prefix; skips lock coordination entirely when set
    #[serde(default)]
    pub static_prefix: Option<String>,

    /// Stored prefixes created before this instant are regenerated
    #[serde(default)]
    pub refresh_before: Option<DateTime<Utc>>,

    /// Lease length of the allocation lock (in seconds)
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    /// Delay between lock acquisition attempts (in milliseconds)
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,

    /// Give up acquiring the lock after this long (in seconds); `None` waits forever
    #[serde(default)]
    pub lock_acquire_timeout_secs: Option<u64>,
}

impl NamespaceConfig {
    /// Validate the namespace configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(prefix) = &self.static_prefix {
            if prefix.trim().is_empty() {
                return Err(crate::Error::validation("Static key prefix cannot be blank"));
            }
            return Ok(());
        }
        if self.host.trim().is_empty() {
            return Err(crate::Error::validation("Namespace host cannot be empty"));
        }
        if self.lock_lease_secs == 0 {
            return Err(crate::Error::validation("lock_lease_secs must be > 0"));
        }
        if self.lock_retry_delay_ms == 0 {
            return Err(crate::Error::validation("lock_retry_delay_ms must be > 0"));
        }
        Ok(())
    }

    /// Lease length as a duration
    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    /// Acquisition retry delay as a duration
    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    /// Acquisition timeout as a duration
    pub fn lock_acquire_timeout(&self) -> Option<Duration> {
        self.lock_acquire_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            static_prefix: None,
            refresh_before: None,
            lock_lease_secs: default_lock_lease_secs(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_acquire_timeout_secs: None,
        }
    }
}

/// Envelope encryption configuration
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// AES-256 key: 32 raw bytes or base64 of 32 bytes; `None` means plaintext
    #[serde(default)]
    pub aes_key: Option<String>,
}

impl CryptoConfig {
    /// Validate the crypto configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.build().map(|_| ())
    }

    /// Build the configured crypto, if any
    pub fn build(&self) -> Result<Option<EnvelopeCrypto>, crate::Error> {
        self.aes_key
            .as_deref()
            .map(EnvelopeCrypto::from_secret)
            .transpose()
    }
}

impl std::fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("aes_key", &self.aes_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Poll cadence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Interval between poll steps (in milliseconds)
    #[serde(default = "default_record_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl PollConfig {
    fn validate(&self, name: &str) -> Result<(), crate::Error> {
        if self.poll_interval_ms == 0 {
            return Err(crate::Error::validation(format!(
                "{}.poll_interval_ms must be > 0",
                name
            )));
        }
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_record_poll_interval_ms(),
        }
    }
}

/// Entity grouper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Interval between grouping steps (in milliseconds)
    #[serde(default = "default_group_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// First path segment under the namespace that holds groupable records
    #[serde(default = "default_root_folder")]
    pub root_folder: String,

    /// Required roles, by file extension
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
}

impl GroupConfig {
    /// Validate the grouper configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.poll_interval_ms == 0 {
            return Err(crate::Error::validation("groups.poll_interval_ms must be > 0"));
        }
        if self.root_folder.trim().is_empty() {
            return Err(crate::Error::validation("Group root folder cannot be empty"));
        }
        if self.roles.is_empty() {
            return Err(crate::Error::validation("At least one group role is required"));
        }
        let mut seen = HashSet::new();
        for role in &self.roles {
            if role.trim().is_empty() {
                return Err(crate::Error::validation("Group role cannot be blank"));
            }
            if !seen.insert(role.as_str()) {
                return Err(crate::Error::validation(format!(
                    "Duplicate group role: {}",
                    role
                )));
            }
        }
        Ok(())
    }

    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_group_poll_interval_ms(),
            root_folder: default_root_folder(),
            roles: default_roles(),
        }
    }
}

fn default_host() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_lock_lease_secs() -> u64 {
    10
}

fn default_lock_retry_delay_ms() -> u64 {
    100
}

fn default_record_poll_interval_ms() -> u64 {
    1000
}

fn default_group_poll_interval_ms() -> u64 {
    5000
}

fn default_root_folder() -> String {
    "certificates".to_string()
}

fn default_roles() -> Vec<String> {
    vec!["json".to_string(), "key".to_string(), "crt".to_string()]
}

fn default_decrypt_error_log_interval_secs() -> u64 {
    10
}
