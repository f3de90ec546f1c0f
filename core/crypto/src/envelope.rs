//! Self-describing encrypted payloads.
//!
//! An [`EncryptedPayload`] carries everything needed to decrypt it apart from
//! the secret: format version, AEAD algorithm, how the key was derived, the
//! salt and the nonce. Salt and nonce are fresh for every seal.

use notevault_common::{Error, Result, SensitiveBytes};
use serde::{Deserialize, Serialize};

use crate::aead::{self, AeadAlgorithm};
use crate::codec::WirePayload;
use crate::kdf::{derive_key, KdfAlgorithm, KdfParams};
use crate::keys::{MasterKey, Salt, DEFAULT_SALT_LEN};

/// Current payload format version.
pub const PAYLOAD_VERSION: u32 = 3;

/// Version written by the earlier browser-based vault.
pub const LEGACY_PAYLOAD_VERSION: u32 = 2;

/// How the key protecting a payload is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    /// Derived from the master password with the payload's salt.
    Password(KdfAlgorithm),
    /// Derived from the session master key with the payload's salt.
    RecordSubkey,
}

/// Encrypted payload with its algorithm metadata.
///
/// Serializes to the JSON wire format described in [`crate::codec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WirePayload", into = "WirePayload")]
pub struct EncryptedPayload {
    /// Format version.
    pub version: u32,
    /// AEAD algorithm.
    pub algorithm: AeadAlgorithm,
    /// Key derivation.
    pub key_source: KeySource,
    /// PBKDF2 iterations or Argon2 time cost; 1 for record subkeys.
    pub iterations: u32,
    /// Argon2 memory cost in KiB.
    pub memory_kib: Option<u32>,
    /// Argon2 lanes.
    pub lanes: Option<u32>,
    /// Key derivation salt.
    pub salt: Salt,
    /// AEAD nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext with authentication tag.
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// KDF parameters recorded in a password payload.
    ///
    /// # Errors
    /// - `MalformedPayload` if the payload is keyed by a record subkey, or if
    ///   the recorded parameters are out of bounds
    pub fn kdf_params(&self) -> Result<KdfParams> {
        let algorithm = match self.key_source {
            KeySource::Password(algorithm) => algorithm,
            KeySource::RecordSubkey => {
                return Err(Error::MalformedPayload(
                    "payload is not password protected".to_string(),
                ))
            }
        };

        let params = KdfParams {
            algorithm,
            iterations: self.iterations,
            memory_kib: self.memory_kib.unwrap_or(0),
            lanes: self.lanes.unwrap_or(0),
            salt_len: self.salt.len(),
        };
        params
            .validate()
            .map_err(|_| Error::MalformedPayload("KDF parameters out of range".to_string()))?;
        Ok(params)
    }

    /// Whether this payload was written by the earlier browser-based vault.
    pub fn is_legacy(&self) -> bool {
        self.version == LEGACY_PAYLOAD_VERSION
    }
}

/// Seal `plaintext` under a key derived from `password` with a fresh salt.
///
/// Returns the payload together with the derived key, so callers that keep
/// the key for a session do not pay for a second derivation.
pub fn seal_with_password(
    password: &[u8],
    plaintext: &[u8],
    params: &KdfParams,
    algorithm: AeadAlgorithm,
) -> Result<(EncryptedPayload, MasterKey)> {
    let salt = Salt::generate(params.salt_len);
    let key = derive_key(password, &salt, params)?;
    let sealed = aead::encrypt(algorithm, key.as_bytes(), plaintext)?;

    let (memory_kib, lanes) = match params.algorithm {
        KdfAlgorithm::Argon2id => (Some(params.memory_kib), Some(params.lanes)),
        KdfAlgorithm::Pbkdf2Sha256 => (None, None),
    };

    let payload = EncryptedPayload {
        version: PAYLOAD_VERSION,
        algorithm,
        key_source: KeySource::Password(params.algorithm),
        iterations: params.iterations,
        memory_kib,
        lanes,
        salt,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
    };
    Ok((payload, key))
}

/// Derive the key recorded in a password payload.
pub fn derive_payload_key(payload: &EncryptedPayload, password: &[u8]) -> Result<MasterKey> {
    let params = payload.kdf_params()?;
    derive_key(password, &payload.salt, &params)
}

/// Open a password payload.
///
/// # Errors
/// - `Authentication` for a wrong password or a tampered payload
pub fn open_with_password(
    payload: &EncryptedPayload,
    password: &[u8],
) -> Result<(SensitiveBytes, MasterKey)> {
    let key = derive_payload_key(payload, password)?;
    let plaintext = aead::decrypt(
        payload.algorithm,
        key.as_bytes(),
        &payload.nonce,
        &payload.ciphertext,
    )?;
    Ok((SensitiveBytes::new(plaintext), key))
}

/// Seal a single record under a subkey of `master` with a fresh salt.
pub fn seal_with_key(
    master: &MasterKey,
    plaintext: &[u8],
    algorithm: AeadAlgorithm,
) -> Result<EncryptedPayload> {
    let salt = Salt::generate(DEFAULT_SALT_LEN);
    let record_key = master.derive_record_key(&salt);
    let sealed = aead::encrypt(algorithm, record_key.as_bytes(), plaintext)?;

    Ok(EncryptedPayload {
        version: PAYLOAD_VERSION,
        algorithm,
        key_source: KeySource::RecordSubkey,
        iterations: 1,
        memory_kib: None,
        lanes: None,
        salt,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
    })
}

/// Open a record payload sealed by [`seal_with_key`].
///
/// # Errors
/// - `Authentication` if the payload does not verify under `master`
/// - `MalformedPayload` if the payload is password protected
pub fn open_with_key(master: &MasterKey, payload: &EncryptedPayload) -> Result<SensitiveBytes> {
    if payload.key_source != KeySource::RecordSubkey {
        return Err(Error::MalformedPayload(
            "payload is not a record payload".to_string(),
        ));
    }
    let record_key = master.derive_record_key(&payload.salt);
    let plaintext = aead::decrypt(
        payload.algorithm,
        record_key.as_bytes(),
        &payload.nonce,
        &payload.ciphertext,
    )?;
    Ok(SensitiveBytes::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    #[test]
    fn test_password_roundtrip_returns_same_key() {
        let params = KdfParams::testing();
        let (payload, key) =
            seal_with_password(b"Secret123", b"[]", &params, AeadAlgorithm::default()).unwrap();

        let (plaintext, reopened_key) = open_with_password(&payload, b"Secret123").unwrap();
        assert_eq!(plaintext.as_bytes(), b"[]");
        assert!(key.ct_eq(&reopened_key));
        assert_eq!(payload.salt.len(), params.salt_len);
    }

    #[test]
    fn test_wrong_password_is_authentication_error() {
        let (payload, _) = seal_with_password(
            b"Secret123",
            b"notes",
            &KdfParams::testing(),
            AeadAlgorithm::default(),
        )
        .unwrap();

        assert!(matches!(
            open_with_password(&payload, b"wrong"),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_seal() {
        let params = KdfParams::testing();
        let (a, _) = seal_with_password(b"pw-pw-pw", b"x", &params, AeadAlgorithm::default()).unwrap();
        let (b, _) = seal_with_password(b"pw-pw-pw", b"x", &params, AeadAlgorithm::default()).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_record_roundtrip() {
        let master = MasterKey::from_bytes([7u8; KEY_LENGTH]);
        let payload = seal_with_key(&master, b"note body", AeadAlgorithm::default()).unwrap();
        assert_eq!(payload.key_source, KeySource::RecordSubkey);

        let plaintext = open_with_key(&master, &payload).unwrap();
        assert_eq!(plaintext.as_bytes(), b"note body");
    }

    #[test]
    fn test_record_under_other_master_fails() {
        let payload = seal_with_key(
            &MasterKey::from_bytes([7u8; KEY_LENGTH]),
            b"note body",
            AeadAlgorithm::default(),
        )
        .unwrap();

        let other = MasterKey::from_bytes([8u8; KEY_LENGTH]);
        assert!(matches!(
            open_with_key(&other, &payload),
            Err(Error::Authentication)
        ));
    }

    #[test]
    fn test_record_open_rejects_password_payload() {
        let (payload, key) = seal_with_password(
            b"Secret123",
            b"x",
            &KdfParams::testing(),
            AeadAlgorithm::default(),
        )
        .unwrap();
        assert!(matches!(
            open_with_key(&key, &payload),
            Err(Error::MalformedPayload(_))
        ));
    }
}
