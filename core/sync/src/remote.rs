//! Remote note service interface.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use notevault_common::{Error, NoteId, OperationId, Result};
use notevault_storage::{NotePatch, OperationType, SyncOperation};

/// Remote service that receives queued note operations.
///
/// Implementations own their transport and authentication. Delivery is
/// at-least-once: the same operation may be pushed more than once, and the
/// remote is expected to de-duplicate by operation id.
#[async_trait]
pub trait RemoteNoteApi: Send + Sync {
    /// Name of the remote, for logging.
    fn name(&self) -> &str;

    /// Push a batch of operations in replay order.
    ///
    /// # Postconditions
    /// - Returns the ids of the operations the remote has durably accepted
    ///
    /// # Errors
    /// - `Network` if the remote could not be reached (retryable)
    /// - `Remote` if the remote rejected the batch
    async fn push(&self, batch: &[SyncOperation]) -> Result<Vec<OperationId>>;
}

/// In-memory remote for testing.
///
/// Keeps the merged state of every note, applying each operation once. Can be switched offline or told to fail the next pushes.
pub struct MemoryRemote {
    notes: RwLock<HashMap<NoteId, NotePatch>>,
    seen: RwLock<HashSet<OperationId>>,
    received: RwLock<Vec<SyncOperation>>,
    offline: AtomicBool,
    fail_next: AtomicU32,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            seen: RwLock::new(HashSet::new()),
            received: RwLock::new(Vec::new()),
            offline: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make every push fail with a network error until set back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` pushes with a network error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Note ids currently present on the remote.
    pub fn note_ids(&self) -> Vec<NoteId> {
        let notes = self.notes.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = notes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Merged state of a note, if the remote holds it.
    pub fn note(&self, id: &NoteId) -> Option<NotePatch> {
        self.notes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Every operation received, duplicates excluded, in arrival order.
    pub fn received(&self) -> Vec<SyncOperation> {
        self.received
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteNoteApi for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, batch: &[SyncOperation]) -> Result<Vec<OperationId>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network("remote is offline".to_string()));
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Network("connection reset".to_string()));
        }

        let mut seen = self.seen.write().unwrap_or_else(|e| e.into_inner());
        let mut notes = self.notes.write().unwrap_or_else(|e| e.into_inner());
        let mut received = self.received.write().unwrap_or_else(|e| e.into_inner());

        let mut accepted = Vec::with_capacity(batch.len());
        for op in batch {
            if seen.insert(op.id.clone()) {
                match op.op_type {
                    OperationType::Create => {
                        notes.insert(op.note_id.clone(), op.payload.clone().unwrap_or_default());
                    }
                    OperationType::Update => {
                        let patch = op.payload.clone().unwrap_or_default();
                        notes.entry(op.note_id.clone()).or_default().merge(patch);
                    }
                    OperationType::Delete => {
                        notes.remove(&op.note_id);
                    }
                }
                received.push(op.clone());
            }
            accepted.push(op.id.clone());
        }
        Ok(accepted)
    }
}
