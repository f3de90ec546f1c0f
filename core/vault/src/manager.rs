//! Vault façade used by front ends.
//!
//! Ties the session, the record store, the sync queue and the snapshot
//! format together. Foreground operations hold the session lock while they
//! use the master key, so once [`VaultManager::lock`] returns no operation
//! can still start with the old key.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};
use zeroize::Zeroizing;

use notevault_common::{Error, NoteId, Result};
use notevault_crypto::{codec, envelope, MasterKey};
use notevault_storage::database::{delete_meta, write_meta, Database};
use notevault_storage::{
    records, Note, NoteContent, NoteRecord, NoteUpdate, RecordStore, SyncOperation, SyncQueue,
};
use notevault_sync::{RemoteNoteApi, SyncEngine, SyncReport};

use crate::config::VaultSettings;
use crate::session::{LockState, SessionManager};
use crate::snapshot::{SnapshotBody, HYDRATE_META_KEY, SNAPSHOT_META_KEY};

/// Result of [`VaultManager::create_or_unlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockSummary {
    /// A new vault was created.
    pub created: bool,
    /// Notes written from an imported snapshot during this unlock.
    pub hydrated: usize,
}

/// Filter for [`VaultManager::search_notes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteQuery {
    /// Case-insensitive text matched against content and tags.
    pub search: Option<String>,
    /// Exact tag the note must carry.
    pub tag: Option<String>,
    pub include_archived: bool,
}

impl NoteQuery {
    fn matches(&self, note: &Note) -> bool {
        if note.archived && !self.include_archived {
            return false;
        }
        if let Some(tag) = &self.tag {
            if !note.tags.contains(tag) {
                return false;
            }
        }
        match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                let in_text = note
                    .content
                    .as_text()
                    .is_some_and(|text| text.to_lowercase().contains(&needle));
                in_text
                    || note
                        .tags
                        .iter()
                        .any(|tag| tag.to_lowercase().contains(&needle))
            }
        }
    }
}

/// Pinned notes first, then most recently updated.
fn sort_notes(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Encrypted note vault.
pub struct VaultManager {
    db: Arc<Database>,
    records: RecordStore,
    queue: SyncQueue,
    session: RwLock<SessionManager>,
    sync: SyncEngine,
    settings: VaultSettings,
}

impl VaultManager {
    /// Open or create the vault database at `path`. The vault starts locked.
    pub fn open(path: impl AsRef<Path>, settings: VaultSettings) -> Result<Self> {
        Self::with_database(Database::open(path)?, settings)
    }

    /// Vault backed by an in-memory database (for testing).
    pub fn in_memory(settings: VaultSettings) -> Result<Self> {
        Self::with_database(Database::in_memory()?, settings)
    }

    fn with_database(db: Database, settings: VaultSettings) -> Result<Self> {
        settings.validate()?;
        let db = Arc::new(db);
        let queue = SyncQueue::new(db.clone());

        Ok(Self {
            records: RecordStore::new(db.clone(), settings.aead),
            sync: SyncEngine::new(queue.clone(), settings.sync.clone()),
            session: RwLock::new(SessionManager::new(settings.clone())),
            queue,
            db,
            settings,
        })
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    fn read_session(&self) -> RwLockReadGuard<'_, SessionManager> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, SessionManager> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a vault has been created in this database.
    pub fn has_vault(&self) -> Result<bool> {
        Ok(self.db.meta(SNAPSHOT_META_KEY)?.is_some())
    }

    pub fn is_unlocked(&self) -> bool {
        self.read_session().is_unlocked()
    }

    pub fn lock_state(&self) -> LockState {
        self.read_session().state()
    }

    /// Create the vault on first use, otherwise unlock it.
    ///
    /// `confirm` is only checked when creating a vault, and only when it is
    /// not empty. After an import, the imported snapshot's notes are written
    /// to the record store under the imported vault's key.
    ///
    /// # Errors
    /// - `InvalidCredentials` for a wrong password; the vault stays locked
    /// - `PasswordPolicy` if a new password is rejected
    pub fn create_or_unlock(&self, confirm: &[u8], password: &[u8]) -> Result<UnlockSummary> {
        let mut session = self.write_session();
        let confirm = (!confirm.is_empty()).then_some(confirm);
        let outcome = session.unlock(password, confirm, &self.db)?;

        let hydrated = if self.db.meta(HYDRATE_META_KEY)?.is_some() {
            let key = session.master_key()?;
            match self.hydrate(key, &outcome.snapshot) {
                Ok(count) => count,
                Err(e) => {
                    session.lock();
                    return Err(e);
                }
            }
        } else {
            0
        };

        Ok(UnlockSummary {
            created: outcome.created,
            hydrated,
        })
    }

    fn hydrate(&self, key: &MasterKey, snapshot: &SnapshotBody) -> Result<usize> {
        let algorithm = self.settings.aead;
        let count = self.db.transaction(|tx| {
            let mut seen = HashSet::new();
            for note in &snapshot.notes {
                if seen.insert(note.id.clone()) {
                    records::insert(tx, key, algorithm, note.to_draft())?;
                }
            }
            delete_meta(tx, HYDRATE_META_KEY)?;
            Ok(seen.len())
        })?;
        info!(notes = count, "Restored notes from imported snapshot");
        Ok(count)
    }

    /// Lock the vault. Always succeeds.
    pub fn lock(&self) {
        self.write_session().lock();
    }

    pub fn record_activity(&self) {
        self.write_session().record_activity();
    }

    /// Lock if idle past the auto-lock timeout. Returns whether it locked.
    pub fn check_auto_lock(&self, now: DateTime<Utc>) -> bool {
        self.write_session().check_auto_lock(now)
    }

    /// Add a note.
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `InvalidInput` if `content` is blank
    pub fn add_note(
        &self,
        content: &str,
        tags: BTreeSet<String>,
        color: Option<String>,
    ) -> Result<Note> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("note content is empty".to_string()));
        }

        let mut session = self.write_session();
        let note = self.records.create(session.master_key()?, content, tags, color)?;
        session.cache_content(&note.id, content);
        Ok(note)
    }

    /// Apply a partial update to a note.
    ///
    /// # Errors
    /// - `NotFound` if the note does not exist
    pub fn edit_note(&self, id: &NoteId, update: NoteUpdate) -> Result<Note> {
        if let Some(content) = &update.content {
            if content.trim().is_empty() {
                return Err(Error::InvalidInput("note content is empty".to_string()));
            }
        }

        let mut session = self.write_session();
        let note = self.records.update(session.master_key()?, id, update)?;
        if let NoteContent::Text(text) = &note.content {
            session.cache_content(&note.id, text);
        }
        Ok(note)
    }

    /// Delete a note. Returns whether it existed.
    pub fn delete_note(&self, id: &NoteId) -> Result<bool> {
        let mut session = self.write_session();
        session.master_key()?;
        let removed = self.records.delete(id)?;
        session.evict_content(id);
        Ok(removed)
    }

    /// Flip the archived flag.
    pub fn toggle_archive(&self, id: &NoteId) -> Result<Note> {
        let current = self.metadata(id)?.archived;
        self.edit_note(id, NoteUpdate::archived(!current))
    }

    /// Flip the pinned flag.
    pub fn toggle_pin(&self, id: &NoteId) -> Result<Note> {
        let current = self.metadata(id)?.pinned;
        self.edit_note(id, NoteUpdate::pinned(!current))
    }

    fn metadata(&self, id: &NoteId) -> Result<NoteRecord> {
        self.read_session().master_key()?;
        self.records
            .record(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Get one decrypted note.
    ///
    /// # Errors
    /// - `NotFound` if the note does not exist
    pub fn get_note(&self, id: &NoteId) -> Result<Note> {
        {
            let session = self.read_session();
            session.master_key()?;
            if let Some(text) = session.cached_content(id) {
                let text = text.to_string();
                if let Some(record) = self.records.record(id)? {
                    debug!(note_id = %id, "Note content served from cache");
                    return Ok(Note {
                        id: record.id,
                        content: NoteContent::Text(text),
                        tags: record.tags,
                        color: record.color,
                        pinned: record.pinned,
                        archived: record.archived,
                        created_at: record.created_at,
                        updated_at: record.updated_at,
                        synced: record.synced,
                    });
                }
            }
        }

        let mut session = self.write_session();
        let note = self
            .records
            .get(session.master_key()?, id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if let NoteContent::Text(text) = &note.content {
            session.cache_content(id, text);
        }
        Ok(note)
    }

    /// All notes, pinned first, then most recently updated.
    pub fn list_notes(&self) -> Result<Vec<Note>> {
        let mut session = self.write_session();
        let mut notes: Vec<Note> = self.records.list(session.master_key()?)?.collect();
        for note in &notes {
            if let NoteContent::Text(text) = &note.content {
                session.cache_content(&note.id, text);
            }
        }
        sort_notes(&mut notes);
        Ok(notes)
    }

    /// Notes matching `query`, in list order.
    pub fn search_notes(&self, query: &NoteQuery) -> Result<Vec<Note>> {
        Ok(self
            .list_notes()?
            .into_iter()
            .filter(|note| query.matches(note))
            .collect())
    }

    /// Export all decryptable notes as a backup sealed under `password`.
    ///
    /// `password` must be the vault's master password. The backup gets a
    /// fresh salt and nonce.
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `InvalidCredentials` if `password` is not the master password
    pub fn export_backup(&self, password: &[u8]) -> Result<Vec<u8>> {
        let session = self.read_session();
        let key = session.master_key()?;

        let stored = self
            .db
            .meta(SNAPSHOT_META_KEY)?
            .ok_or_else(|| Error::NotFound("vault snapshot".to_string()))?;
        let canonical = codec::deserialize(stored.as_bytes())?;
        if password.is_empty() {
            return Err(Error::InvalidCredentials);
        }
        let candidate = envelope::derive_payload_key(&canonical, password)?;
        if !candidate.ct_eq(key) {
            return Err(Error::InvalidCredentials);
        }

        let notes: Vec<Note> = self.records.list(key)?.collect();
        let body = SnapshotBody::from_notes(&notes);
        let plaintext = Zeroizing::new(body.to_json()?);
        let (payload, _) = envelope::seal_with_password(
            password,
            &plaintext,
            &self.settings.kdf,
            self.settings.aead,
        )?;

        info!(notes = body.notes.len(), "Exported backup");
        codec::serialize(&payload)
    }

    /// Replace the vault with a backup.
    ///
    /// The backup becomes the canonical snapshot, local notes are deleted
    /// (queueing DELETE operations) and the vault locks. The next unlock,
    /// with the backup's password, restores the backup's notes.
    ///
    /// # Errors
    /// - `InvalidBackup` if `bytes` is not a valid backup; nothing changes
    pub fn import_backup(&self, bytes: &[u8]) -> Result<usize> {
        let payload = codec::parse_backup(bytes)?;
        let encoded = String::from_utf8(codec::serialize(&payload)?)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut session = self.write_session();
        let removed = self.db.transaction(|tx| {
            write_meta(tx, SNAPSHOT_META_KEY, &encoded)?;
            let removed = records::delete_all(tx)?;
            write_meta(tx, HYDRATE_META_KEY, "1")?;
            Ok(removed)
        })?;
        session.lock();

        info!(removed, legacy = payload.is_legacy(), "Imported backup");
        Ok(removed)
    }

    /// Operations waiting to be synced, in replay order.
    pub fn pending_operations(&self) -> Result<Vec<SyncOperation>> {
        self.queue.drain()
    }

    /// Push pending operations to `remote`. Works while locked: queued
    /// operations carry only ciphertext.
    pub async fn sync_now(&self, remote: &dyn RemoteNoteApi) -> Result<SyncReport> {
        self.sync.sync(remote).await
    }
}
