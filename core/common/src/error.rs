//! Common error types for NoteVault.
//!
//! Messages never carry plaintext or key material, and a wrong password is
//! never distinguished from corrupted ciphertext.

use thiserror::Error;

/// Top-level error type for NoteVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The master password did not open the vault.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// An AEAD tag failed to verify (tampered data or wrong key).
    #[error("Authentication failed")]
    Authentication,

    /// A persisted payload is structurally invalid.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// An imported backup is structurally invalid.
    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The session is locked; the caller must unlock again.
    #[error("Vault is locked")]
    Locked,

    /// A new master password does not satisfy the password policy.
    #[error("Password rejected: {0}")]
    PasswordPolicy(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cryptographic operation failed for a reason other than authentication.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Local database operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The remote note service could not be reached. Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote note service rejected a request.
    #[error("Remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Whether the failed operation may succeed if attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("offline".to_string()).is_retryable());
        assert!(!Error::Remote("rejected".to_string()).is_retryable());
        assert!(!Error::InvalidCredentials.is_retryable());
    }

    #[test]
    fn test_credential_errors_are_uniform() {
        // Neither message hints at which of the two causes occurred.
        assert_eq!(Error::InvalidCredentials.to_string(), "Invalid credentials");
        assert_eq!(Error::Authentication.to_string(), "Authentication failed");
    }
}
