//! Common utilities and types shared across NoteVault crates.
//!
//! This module provides the error taxonomy used by every layer and the
//! identifier types for notes and sync operations.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{NoteId, OperationId, SensitiveBytes};
