//! Password-based key derivation.
//!
//! PBKDF2-HMAC-SHA256 is the default, matching the payloads written by
//! earlier versions of the vault. Argon2id is available for vaults that
//! want a memory-hard function.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::keys::{MasterKey, Salt, DEFAULT_SALT_LEN, KEY_LENGTH};
use notevault_common::{Error, Result};

/// Default PBKDF2 iteration count.
pub const DEFAULT_KDF_ITERATIONS: u32 = 150_000;

/// Lowest PBKDF2 iteration count accepted anywhere.
pub const MIN_KDF_ITERATIONS: u32 = 1_000;

/// Highest PBKDF2 iteration count accepted from a decoded payload.
pub const MAX_KDF_ITERATIONS: u32 = 10_000_000;

/// Highest Argon2 time cost accepted from a decoded payload.
pub const MAX_ARGON2_TIME_COST: u32 = 64;

/// Highest Argon2 memory cost (KiB) accepted from a decoded payload.
pub const MAX_ARGON2_MEMORY_KIB: u32 = 1_048_576;

/// Password key derivation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256.
    Pbkdf2Sha256,
    /// Argon2id, version 0x13.
    Argon2id,
}

/// Parameters for password key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Derivation function.
    pub algorithm: KdfAlgorithm,
    /// PBKDF2 iterations, or Argon2 time cost.
    pub iterations: u32,
    /// Argon2 memory cost in KiB. Ignored by PBKDF2.
    #[serde(default)]
    pub memory_kib: u32,
    /// Argon2 degree of parallelism. Ignored by PBKDF2.
    #[serde(default)]
    pub lanes: u32,
    /// Length of freshly generated salts.
    #[serde(default = "default_salt_len")]
    pub salt_len: usize,
}

fn default_salt_len() -> usize {
    DEFAULT_SALT_LEN
}

impl KdfParams {
    /// PBKDF2-SHA256 with the default iteration count.
    pub fn pbkdf2(iterations: u32) -> Self {
        Self {
            algorithm: KdfAlgorithm::Pbkdf2Sha256,
            iterations,
            memory_kib: 0,
            lanes: 0,
            salt_len: DEFAULT_SALT_LEN,
        }
    }

    /// Argon2id tuned for interactive unlock on desktop hardware.
    pub fn argon2id_interactive() -> Self {
        Self {
            algorithm: KdfAlgorithm::Argon2id,
            iterations: 3,
            memory_kib: 65536, // 64 MiB
            lanes: 4,
            salt_len: DEFAULT_SALT_LEN,
        }
    }

    /// Cheapest parameters accepted. For tests only.
    pub fn testing() -> Self {
        Self::pbkdf2(MIN_KDF_ITERATIONS)
    }

    /// Check that the parameters are within the accepted bounds.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            KdfAlgorithm::Pbkdf2Sha256 => {
                if !(MIN_KDF_ITERATIONS..=MAX_KDF_ITERATIONS).contains(&self.iterations) {
                    return Err(Error::InvalidInput(format!(
                        "PBKDF2 iterations must be within {}..={}",
                        MIN_KDF_ITERATIONS, MAX_KDF_ITERATIONS
                    )));
                }
            }
            KdfAlgorithm::Argon2id => {
                if !(1..=MAX_ARGON2_TIME_COST).contains(&self.iterations) {
                    return Err(Error::InvalidInput(
                        "Argon2 time cost out of range".to_string(),
                    ));
                }
                if self.lanes == 0 || self.lanes > 16 {
                    return Err(Error::InvalidInput("Argon2 lanes out of range".to_string()));
                }
                if self.memory_kib < 8 * self.lanes || self.memory_kib > MAX_ARGON2_MEMORY_KIB {
                    return Err(Error::InvalidInput(
                        "Argon2 memory cost out of range".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::pbkdf2(DEFAULT_KDF_ITERATIONS)
    }
}

/// Derive a master key from a password and salt.
///
/// # Preconditions
/// - `password` must not be empty
/// - `params` must pass [`KdfParams::validate`]
///
/// # Postconditions
/// - The derived key is deterministic given the same inputs
///
/// # Security
/// - Password is not stored or logged
/// - Intermediate key bytes are zeroized
pub fn derive_key(password: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if password.is_empty() {
        return Err(Error::InvalidInput("Password cannot be empty".to_string()));
    }
    params.validate()?;

    let mut key_bytes = [0u8; KEY_LENGTH];
    match params.algorithm {
        KdfAlgorithm::Pbkdf2Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(
                password,
                salt.as_bytes(),
                params.iterations,
                &mut key_bytes,
            );
        }
        KdfAlgorithm::Argon2id => {
            let argon2_params = Params::new(
                params.memory_kib,
                params.iterations,
                params.lanes,
                Some(KEY_LENGTH),
            )
            .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

            let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
            argon2
                .hash_password_into(password, salt.as_bytes(), &mut key_bytes)
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
    }

    let key = MasterKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}
