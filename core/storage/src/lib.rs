//! Local persistence for NoteVault.
//!
//! One SQLite database holds:
//! - Encrypted note records ([`RecordStore`])
//! - The queue of mutations awaiting remote sync ([`SyncQueue`])
//! - Vault metadata such as the canonical snapshot
//!
//! # Design Principles
//! - Note content is only ever written as an encrypted payload
//! - A note mutation and its queued operation commit together
//! - Queue replay order is stable across restarts

pub mod database;
pub mod note;
pub mod queue;
pub mod records;

pub use database::Database;
pub use note::{parse_tags, Note, NoteContent, NoteDraft, NotePatch, NoteRecord, NoteUpdate};
pub use queue::{OperationType, SyncOperation, SyncQueue};
pub use records::RecordStore;
