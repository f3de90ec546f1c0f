//! Text encoding of [`EncryptedPayload`].
//!
//! Payloads are stored and exported as JSON objects with base64 binary
//! fields:
//!
//! ```text
//! { "version": 3, "alg": "XCHACHA20-POLY1305", "kdf": "PBKDF2-SHA256",
//!   "iter": 150000, "salt": "...", "nonce": "...", "ciphertext": "..." }
//! ```
//!
//! Version 2 payloads from the browser vault (`v`, `iv`, `"AES-GCM"`) are
//! accepted on input. Output uses the current field names and keeps the
//! payload's version, so a decoded payload encodes back to an equal one.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::aead::{AeadAlgorithm, TAG_SIZE};
use crate::envelope::{EncryptedPayload, KeySource, LEGACY_PAYLOAD_VERSION, PAYLOAD_VERSION};
use crate::kdf::{KdfAlgorithm, DEFAULT_KDF_ITERATIONS};
use crate::keys::{Salt, MAX_SALT_LEN, MIN_SALT_LEN};
use notevault_common::{Error, Result};

const ALG_XCHACHA: &str = "XCHACHA20-POLY1305";
const ALG_AES_GCM: &str = "AES-256-GCM";
const ALG_AES_GCM_LEGACY: &str = "AES-GCM";

const KDF_PBKDF2: &str = "PBKDF2-SHA256";
const KDF_ARGON2ID: &str = "ARGON2ID";
const KDF_RECORD_SUBKEY: &str = "BLAKE2B-SUBKEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WirePayload {
    #[serde(alias = "v", default)]
    version: Option<u32>,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    kdf: Option<String>,
    #[serde(alias = "iterations", default)]
    iter: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mem_kib: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lanes: Option<u32>,
    #[serde(default)]
    salt: Option<String>,
    #[serde(alias = "iv", default)]
    nonce: Option<String>,
    #[serde(default)]
    ciphertext: Option<String>,
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPayload(msg.into())
}

fn alg_tag(algorithm: AeadAlgorithm) -> &'static str {
    match algorithm {
        AeadAlgorithm::XChaCha20Poly1305 => ALG_XCHACHA,
        AeadAlgorithm::Aes256Gcm => ALG_AES_GCM,
    }
}

fn kdf_tag(source: KeySource) -> &'static str {
    match source {
        KeySource::Password(KdfAlgorithm::Pbkdf2Sha256) => KDF_PBKDF2,
        KeySource::Password(KdfAlgorithm::Argon2id) => KDF_ARGON2ID,
        KeySource::RecordSubkey => KDF_RECORD_SUBKEY,
    }
}

fn parse_alg(tag: &str) -> Result<AeadAlgorithm> {
    match tag {
        ALG_XCHACHA => Ok(AeadAlgorithm::XChaCha20Poly1305),
        ALG_AES_GCM | ALG_AES_GCM_LEGACY => Ok(AeadAlgorithm::Aes256Gcm),
        other => Err(malformed(format!("unsupported algorithm {:?}", other))),
    }
}

fn parse_kdf(tag: &str) -> Result<KeySource> {
    match tag {
        KDF_PBKDF2 => Ok(KeySource::Password(KdfAlgorithm::Pbkdf2Sha256)),
        KDF_ARGON2ID => Ok(KeySource::Password(KdfAlgorithm::Argon2id)),
        KDF_RECORD_SUBKEY => Ok(KeySource::RecordSubkey),
        other => Err(malformed(format!("unsupported KDF {:?}", other))),
    }
}

fn decode_field(name: &str, value: Option<&str>) -> Result<Vec<u8>> {
    let value = value.ok_or_else(|| malformed(format!("missing field `{}`", name)))?;
    STANDARD
        .decode(value.trim())
        .map_err(|_| malformed(format!("field `{}` is not valid base64", name)))
}

impl From<EncryptedPayload> for WirePayload {
    fn from(payload: EncryptedPayload) -> Self {
        WirePayload {
            version: Some(payload.version),
            alg: Some(alg_tag(payload.algorithm).to_string()),
            kdf: Some(kdf_tag(payload.key_source).to_string()),
            iter: Some(payload.iterations),
            mem_kib: payload.memory_kib,
            lanes: payload.lanes,
            salt: Some(STANDARD.encode(payload.salt.as_bytes())),
            nonce: Some(STANDARD.encode(&payload.nonce)),
            ciphertext: Some(STANDARD.encode(&payload.ciphertext)),
        }
    }
}

impl TryFrom<WirePayload> for EncryptedPayload {
    type Error = Error;

    fn try_from(wire: WirePayload) -> Result<Self> {
        let ciphertext = decode_field("ciphertext", wire.ciphertext.as_deref())?;
        let nonce = decode_field("nonce", wire.nonce.as_deref())?;
        let salt = decode_field("salt", wire.salt.as_deref())?;

        let version = wire.version.unwrap_or(LEGACY_PAYLOAD_VERSION);
        if version != PAYLOAD_VERSION && version != LEGACY_PAYLOAD_VERSION {
            return Err(malformed(format!("unsupported version {}", version)));
        }

        let algorithm = match wire.alg.as_deref() {
            Some(tag) => parse_alg(tag)?,
            None if version == LEGACY_PAYLOAD_VERSION => AeadAlgorithm::Aes256Gcm,
            None => return Err(malformed("missing field `alg`")),
        };
        let key_source = match wire.kdf.as_deref() {
            Some(tag) => parse_kdf(tag)?,
            None if version == LEGACY_PAYLOAD_VERSION => {
                KeySource::Password(KdfAlgorithm::Pbkdf2Sha256)
            }
            None => return Err(malformed("missing field `kdf`")),
        };

        if nonce.len() != algorithm.nonce_size() {
            return Err(malformed(format!(
                "nonce must be {} bytes, got {}",
                algorithm.nonce_size(),
                nonce.len()
            )));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(malformed("ciphertext shorter than authentication tag"));
        }
        if !(MIN_SALT_LEN..=MAX_SALT_LEN).contains(&salt.len()) {
            return Err(malformed(format!("salt length {} out of range", salt.len())));
        }

        let iterations = match key_source {
            KeySource::RecordSubkey => wire.iter.unwrap_or(1),
            KeySource::Password(_) => wire.iter.unwrap_or(DEFAULT_KDF_ITERATIONS),
        };

        let payload = EncryptedPayload {
            version,
            algorithm,
            key_source,
            iterations,
            memory_kib: wire.mem_kib,
            lanes: wire.lanes,
            salt: Salt::from_bytes(salt),
            nonce,
            ciphertext,
        };

        if let KeySource::Password(_) = key_source {
            payload.kdf_params()?;
        }
        Ok(payload)
    }
}

/// Encode a payload as compact JSON text.
pub fn serialize(payload: &EncryptedPayload) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode and validate payload text.
///
/// # Errors
/// - `MalformedPayload` if the text is not a payload object, a required
///   field is missing, a binary field is not base64, the version or an
///   algorithm is unknown, or a length or cost is out of bounds
pub fn deserialize(bytes: &[u8]) -> Result<EncryptedPayload> {
    serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))
}

/// Decode imported backup bytes.
///
/// Same rules as [`deserialize`], applied to untrusted input. The backup
/// must be password protected.
///
/// # Errors
/// - `InvalidBackup` for anything that is not a well-formed password payload
pub fn parse_backup(bytes: &[u8]) -> Result<EncryptedPayload> {
    let payload = deserialize(bytes).map_err(|e| match e {
        Error::MalformedPayload(msg) => Error::InvalidBackup(msg),
        other => other,
    })?;

    if payload.key_source == KeySource::RecordSubkey {
        return Err(Error::InvalidBackup(
            "backup is not password protected".to_string(),
        ));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{open_with_password, seal_with_key, seal_with_password};
    use crate::kdf::KdfParams;
    use crate::keys::{MasterKey, KEY_LENGTH};

    fn sample() -> EncryptedPayload {
        let (payload, _) = seal_with_password(
            b"Secret123",
            br#"{"notes":[]}"#,
            &KdfParams::testing(),
            AeadAlgorithm::default(),
        )
        .unwrap();
        payload
    }

    #[test]
    fn test_serialize_field_names() {
        let text = serialize(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&text).unwrap();

        assert_eq!(value["version"], 3);
        assert_eq!(value["alg"], "XCHACHA20-POLY1305");
        assert_eq!(value["kdf"], "PBKDF2-SHA256");
        assert_eq!(value["iter"], 1000);
        assert!(value["salt"].is_string());
        assert!(value["nonce"].is_string());
        assert!(value["ciphertext"].is_string());
        assert!(value.get("mem_kib").is_none());
    }

    #[test]
    fn test_deserialize_restores_payload() {
        let payload = sample();
        let restored = deserialize(&serialize(&payload).unwrap()).unwrap();
        assert_eq!(restored, payload);

        let (plaintext, _) = open_with_password(&restored, b"Secret123").unwrap();
        assert_eq!(plaintext.as_bytes(), br#"{"notes":[]}"#);
    }

    #[test]
    fn test_record_payload_tag() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let payload = seal_with_key(&master, b"hello", AeadAlgorithm::default()).unwrap();
        let text = serialize(&payload).unwrap();
        assert!(String::from_utf8_lossy(&text).contains("BLAKE2B-SUBKEY"));
        assert_eq!(deserialize(&text).unwrap(), payload);
    }

    #[test]
    fn test_legacy_browser_payload_accepted() {
        let text = format!(
            r#"{{"v":2,"alg":"AES-GCM","kdf":"PBKDF2-SHA256","iter":150000,"salt":"{}","iv":"{}","ciphertext":"{}"}}"#,
            STANDARD.encode([1u8; 16]),
            STANDARD.encode([2u8; 12]),
            STANDARD.encode([3u8; 40]),
        );
        let payload = deserialize(text.as_bytes()).unwrap();
        assert_eq!(payload.version, LEGACY_PAYLOAD_VERSION);
        assert!(payload.is_legacy());
        assert_eq!(payload.algorithm, AeadAlgorithm::Aes256Gcm);
        assert_eq!(payload.iterations, 150_000);
        assert_eq!(payload.nonce.len(), 12);
    }

    #[test]
    fn test_legacy_payload_keeps_version() {
        let text = format!(
            r#"{{"v":2,"salt":"{}","iv":"{}","ciphertext":"{}","iterations":2000}}"#,
            STANDARD.encode([1u8; 16]),
            STANDARD.encode([2u8; 12]),
            STANDARD.encode([3u8; 40]),
        );
        let payload = deserialize(text.as_bytes()).unwrap();

        let reencoded = serialize(&payload).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&reencoded).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["alg"], "AES-256-GCM");

        let restored = deserialize(&reencoded).unwrap();
        assert_eq!(restored, payload);
        assert!(restored.is_legacy());
    }

    #[test]
    fn test_missing_fields_rejected() {
        for field in ["salt", "nonce", "ciphertext"] {
            let mut value: serde_json::Value =
                serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
            value.as_object_mut().unwrap().remove(field);
            let err = deserialize(value.to_string().as_bytes()).unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)), "{}", field);
        }
    }

    #[test]
    fn test_bad_base64_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
        value["nonce"] = "not base64!!".into();
        assert!(matches!(
            deserialize(value.to_string().as_bytes()),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_unknown_version_and_alg_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
        value["version"] = 9.into();
        assert!(deserialize(value.to_string().as_bytes()).is_err());

        value["version"] = 3.into();
        value["alg"] = "ROT13".into();
        assert!(deserialize(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_nonce_length_must_match_algorithm() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
        value["alg"] = "AES-256-GCM".into();
        assert!(matches!(
            deserialize(value.to_string().as_bytes()),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_iterations_out_of_range_rejected() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
        value["iter"] = 5.into();
        assert!(deserialize(value.to_string().as_bytes()).is_err());

        value["iter"] = 4_000_000_000u32.into();
        assert!(deserialize(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_parse_backup_errors_are_invalid_backup() {
        assert!(matches!(parse_backup(b"not json"), Err(Error::InvalidBackup(_))));
        assert!(matches!(parse_backup(&[0xff, 0xfe]), Err(Error::InvalidBackup(_))));

        let mut value: serde_json::Value =
            serde_json::from_slice(&serialize(&sample()).unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("salt");
        assert!(matches!(
            parse_backup(value.to_string().as_bytes()),
            Err(Error::InvalidBackup(_))
        ));
    }

    #[test]
    fn test_parse_backup_rejects_record_payload() {
        let master = MasterKey::from_bytes([1u8; KEY_LENGTH]);
        let payload = seal_with_key(&master, b"hello", AeadAlgorithm::default()).unwrap();
        let text = serialize(&payload).unwrap();
        assert!(matches!(
            parse_backup(&text),
            Err(Error::InvalidBackup(_))
        ));
    }

    #[test]
    fn test_parse_backup_accepts_export() {
        let payload = sample();
        let text = serialize(&payload).unwrap();
        assert_eq!(parse_backup(&text).unwrap(), payload);
    }
}
