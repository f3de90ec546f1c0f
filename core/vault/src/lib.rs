//! Vault engine for NoteVault.
//!
//! This module provides:
//! - Vault creation, unlock and auto-lock
//! - Note operations over the encrypted record store
//! - Encrypted backup export and import
//! - Access to the pending sync queue
//!
//! # Architecture
//! The vault sits between the user interface and local storage. It owns the
//! session key and handles all encryption and decryption transparently.

pub mod config;
pub mod manager;
pub mod session;
pub mod snapshot;

pub use config::VaultSettings;
pub use manager::{NoteQuery, UnlockSummary, VaultManager};
pub use session::{LockState, SessionManager, UnlockOutcome};
pub use snapshot::{SnapshotBody, SnapshotNote};
