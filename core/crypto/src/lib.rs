//! Cryptographic primitives for NoteVault.
//!
//! This crate provides:
//! - Password key derivation (PBKDF2-SHA256, Argon2id)
//! - Authenticated encryption (XChaCha20-Poly1305, AES-256-GCM)
//! - Self-describing encrypted payloads and their text encoding
//! - Key types with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is zeroized on drop
//! - No plaintext or key material is ever logged
//! - A wrong key and tampered ciphertext fail with the same error

pub mod aead;
pub mod codec;
pub mod envelope;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, AeadAlgorithm};
pub use envelope::{
    derive_payload_key, open_with_key, open_with_password, seal_with_key, seal_with_password,
    EncryptedPayload, KeySource, PAYLOAD_VERSION,
};
pub use kdf::{derive_key, KdfAlgorithm, KdfParams};
pub use keys::{MasterKey, RecordKey, Salt};
