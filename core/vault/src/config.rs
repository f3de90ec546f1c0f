//! Vault settings.

use serde::{Deserialize, Serialize};
use std::path::Path;

use notevault_common::{Error, Result};
use notevault_crypto::{AeadAlgorithm, KdfParams};
use notevault_sync::SyncConfig;

/// Inactivity period after which an unlocked vault locks itself (5 minutes).
pub const DEFAULT_AUTO_LOCK_MS: u64 = 5 * 60 * 1000;

/// Longest accepted auto-lock timeout (7 days).
pub const MAX_AUTO_LOCK_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Minimum length of a new master password.
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 6;

/// Tunable vault behavior.
///
/// Every field has a secure default; a settings file only needs to list the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSettings {
    /// Key derivation for new snapshots and backups.
    pub kdf: KdfParams,
    /// Cipher for everything written from now on.
    pub aead: AeadAlgorithm,
    pub auto_lock_timeout_ms: u64,
    pub min_password_len: usize,
    /// Batching and backoff for pushes to the remote.
    pub sync: SyncConfig,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            aead: AeadAlgorithm::default(),
            auto_lock_timeout_ms: DEFAULT_AUTO_LOCK_MS,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            sync: SyncConfig::default(),
        }
    }
}

impl VaultSettings {
    /// Cheap key derivation for tests.
    pub fn testing() -> Self {
        Self {
            kdf: KdfParams::testing(),
            ..Self::default()
        }
    }

    pub fn with_auto_lock_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.auto_lock_timeout_ms = timeout_ms;
        self
    }

    /// Check the settings before use.
    pub fn validate(&self) -> Result<()> {
        self.kdf.validate()?;
        if self.auto_lock_timeout_ms == 0 || self.auto_lock_timeout_ms > MAX_AUTO_LOCK_MS {
            return Err(Error::InvalidInput(format!(
                "auto-lock timeout must be between 1 and {} ms",
                MAX_AUTO_LOCK_MS
            )));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::InvalidInput(
                "sync batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
