//! NoteVault sync engine.
//!
//! Pushes the durable queue of note operations to a remote note service:
//! - Remote interface ([`RemoteNoteApi`]) and an in-memory remote
//! - Batched, ordered delivery with acknowledgement
//! - Retry with exponential backoff on transient failures

pub mod engine;
pub mod remote;
pub mod retry;

pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use remote::{MemoryRemote, RemoteNoteApi};
pub use retry::{RetryConfig, RetryExecutor};
