//! Authenticated encryption.
//!
//! XChaCha20-Poly1305 is used for everything this crate writes; its 24-byte
//! nonce is safe for random generation. AES-256-GCM is kept so that backups
//! produced by the earlier browser-based vault can still be opened.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::keys::KEY_LENGTH;
use notevault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Nonce size for AES-256-GCM (12 bytes).
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Authentication tag size, identical for both algorithms (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AeadAlgorithm {
    /// XChaCha20-Poly1305 with a 256-bit key.
    #[default]
    XChaCha20Poly1305,
    /// AES-256-GCM with a 256-bit key.
    Aes256Gcm,
}

impl AeadAlgorithm {
    /// Nonce length required by the algorithm.
    pub fn nonce_size(self) -> usize {
        match self {
            AeadAlgorithm::XChaCha20Poly1305 => XCHACHA_NONCE_SIZE,
            AeadAlgorithm::Aes256Gcm => AES_GCM_NONCE_SIZE,
        }
    }
}

/// Output of a single encryption call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Freshly generated nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext followed by the authentication tag.
    pub ciphertext: Vec<u8>,
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(())
}

/// Encrypt plaintext under `key`.
///
/// # Postconditions
/// - A new random nonce of `algorithm.nonce_size()` bytes is generated
/// - `ciphertext.len() == plaintext.len() + TAG_SIZE`
///
/// # Errors
/// - Key length is not KEY_LENGTH
pub fn encrypt(algorithm: AeadAlgorithm, key: &[u8], plaintext: &[u8]) -> Result<Sealed> {
    check_key(key)?;

    let mut nonce = vec![0u8; algorithm.nonce_size()];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = match algorithm {
        AeadAlgorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key));
            cipher.encrypt(GenericArray::from_slice(&nonce), plaintext)
        }
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
            cipher.encrypt(GenericArray::from_slice(&nonce), plaintext)
        }
    }
    .map_err(|_| Error::Crypto("Encryption failed".to_string()))?;

    Ok(Sealed { nonce, ciphertext })
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// # Errors
/// - `Error::Authentication` if the tag does not verify. A wrong key and a
///   tampered ciphertext produce the same error.
/// - `Error::Crypto` if the key or nonce has the wrong length
pub fn decrypt(
    algorithm: AeadAlgorithm,
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    check_key(key)?;

    if nonce.len() != algorithm.nonce_size() {
        return Err(Error::Crypto(format!(
            "Invalid nonce length: expected {}, got {}",
            algorithm.nonce_size(),
            nonce.len()
        )));
    }

    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Authentication);
    }

    match algorithm {
        AeadAlgorithm::XChaCha20Poly1305 => {
            let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key));
            cipher.decrypt(GenericArray::from_slice(nonce), ciphertext)
        }
        AeadAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
            cipher.decrypt(GenericArray::from_slice(nonce), ciphertext)
        }
    }
    .map_err(|_| Error::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALGORITHMS: [AeadAlgorithm; 2] =
        [AeadAlgorithm::XChaCha20Poly1305, AeadAlgorithm::Aes256Gcm];

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        for alg in ALGORITHMS {
            let sealed = encrypt(alg, &key, b"Hello, World!").unwrap();
            let decrypted = decrypt(alg, &key, &sealed.nonce, &sealed.ciphertext).unwrap();
            assert_eq!(decrypted, b"Hello, World!");
        }
    }

    #[test]
    fn test_ciphertext_and_nonce_size() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        for alg in ALGORITHMS {
            let sealed = encrypt(alg, &key, plaintext).unwrap();
            assert_eq!(sealed.nonce.len(), alg.nonce_size());
            assert_eq!(sealed.ciphertext.len(), plaintext.len() + TAG_SIZE);
        }
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Same plaintext";

        let ct1 = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, plaintext).unwrap();
        let ct2 = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, plaintext).unwrap();

        assert_ne!(ct1.nonce, ct2.nonce);
        assert_ne!(ct1.ciphertext, ct2.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_with_authentication_error() {
        let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &[1u8; KEY_LENGTH], b"Secret").unwrap();
        let result = decrypt(
            AeadAlgorithm::XChaCha20Poly1305,
            &[2u8; KEY_LENGTH],
            &sealed.nonce,
            &sealed.ciphertext,
        );

        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];
        let mut sealed = encrypt(AeadAlgorithm::Aes256Gcm, &key, b"Important data").unwrap();
        sealed.ciphertext[5] ^= 0xFF;

        let result = decrypt(AeadAlgorithm::Aes256Gcm, &key, &sealed.nonce, &sealed.ciphertext);
        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let key = [42u8; KEY_LENGTH];
        let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, b"data").unwrap();
        let result = decrypt(
            AeadAlgorithm::XChaCha20Poly1305,
            &key,
            &sealed.nonce,
            &sealed.ciphertext[..TAG_SIZE - 1],
        );
        assert!(matches!(result, Err(Error::Authentication)));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(encrypt(AeadAlgorithm::XChaCha20Poly1305, &[0u8; 16], b"data").is_err());
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let key = [42u8; KEY_LENGTH];
        let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, b"data").unwrap();
        let result = decrypt(AeadAlgorithm::Aes256Gcm, &key, &sealed.nonce, &sealed.ciphertext);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_LENGTH];
        let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, b"").unwrap();
        let decrypted =
            decrypt(AeadAlgorithm::XChaCha20Poly1305, &key, &sealed.nonce, &sealed.ciphertext)
                .unwrap();
        assert!(decrypted.is_empty());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..2048),
            key in proptest::array::uniform32(any::<u8>()),
        ) {
            let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key, &plaintext).unwrap();
            let decrypted = decrypt(
                AeadAlgorithm::XChaCha20Poly1305,
                &key,
                &sealed.nonce,
                &sealed.ciphertext,
            ).unwrap();
            prop_assert_eq!(decrypted, plaintext);
        }

        #[test]
        fn prop_wrong_key_rejected(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
            key1 in proptest::array::uniform32(any::<u8>()),
            key2 in proptest::array::uniform32(any::<u8>()),
        ) {
            prop_assume!(key1 != key2);
            let sealed = encrypt(AeadAlgorithm::XChaCha20Poly1305, &key1, &plaintext).unwrap();
            let result = decrypt(
                AeadAlgorithm::XChaCha20Poly1305,
                &key2,
                &sealed.nonce,
                &sealed.ciphertext,
            );
            prop_assert!(matches!(result, Err(Error::Authentication)));
        }
    }
}
