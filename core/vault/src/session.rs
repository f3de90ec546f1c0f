//! Session lock state.
//!
//! The session owns the master key while the vault is unlocked, together
//! with a cache of decrypted note bodies. Locking drops both; key bytes and
//! cached plaintext are zeroized.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use notevault_common::{Error, NoteId, Result};
use notevault_crypto::{codec, envelope, MasterKey};
use notevault_storage::database::Database;

use crate::config::VaultSettings;
use crate::snapshot::{SnapshotBody, SNAPSHOT_META_KEY};

/// Lock state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No key material is held.
    Locked,
    /// The master key is resident.
    Unlocked,
}

/// Result of a successful unlock.
#[derive(Debug)]
pub struct UnlockOutcome {
    /// A new vault was created by this unlock.
    pub created: bool,
    /// Decrypted canonical snapshot.
    pub snapshot: SnapshotBody,
}

/// Session state machine.
pub struct SessionManager {
    settings: VaultSettings,
    master_key: Option<MasterKey>,
    content_cache: HashMap<NoteId, Zeroizing<String>>,
    last_activity_at: DateTime<Utc>,
}

impl SessionManager {
    /// Create a locked session.
    pub fn new(settings: VaultSettings) -> Self {
        Self {
            settings,
            master_key: None,
            content_cache: HashMap::new(),
            last_activity_at: Utc::now(),
        }
    }

    pub fn state(&self) -> LockState {
        if self.master_key.is_some() {
            LockState::Unlocked
        } else {
            LockState::Locked
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.state() == LockState::Unlocked
    }

    pub fn settings(&self) -> &VaultSettings {
        &self.settings
    }

    /// Unlock with `password`.
    ///
    /// Any key already held is dropped first, so a failed attempt always
    /// leaves the session locked.
    ///
    /// Without a stored snapshot this is the first run: the password is
    /// checked against the policy (and against `confirm`, when given), and an
    /// empty snapshot is sealed under a fresh salt and stored.
    ///
    /// # Errors
    /// - `InvalidCredentials` if the password does not open the snapshot;
    ///   the session stays locked
    /// - `PasswordPolicy` on first run if the password is too short or does
    ///   not match `confirm`
    /// - `MalformedPayload` if the stored snapshot is corrupt
    pub fn unlock(
        &mut self,
        password: &[u8],
        confirm: Option<&[u8]>,
        db: &Database,
    ) -> Result<UnlockOutcome> {
        self.unlock_at(password, confirm, db, Utc::now())
    }

    /// [`unlock`](Self::unlock) with an explicit clock reading.
    pub fn unlock_at(
        &mut self,
        password: &[u8],
        confirm: Option<&[u8]>,
        db: &Database,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome> {
        self.lock();
        let outcome = match db.meta(SNAPSHOT_META_KEY)? {
            None => self.create_vault(password, confirm, db)?,
            Some(stored) => self.open_vault(password, &stored)?,
        };

        self.last_activity_at = now;
        info!(created = outcome.created, "Vault unlocked");
        Ok(outcome)
    }

    fn create_vault(
        &mut self,
        password: &[u8],
        confirm: Option<&[u8]>,
        db: &Database,
    ) -> Result<UnlockOutcome> {
        self.check_password_policy(password, confirm)?;

        let snapshot = SnapshotBody::empty();
        let plaintext = Zeroizing::new(snapshot.to_json()?);
        let (payload, key) = envelope::seal_with_password(
            password,
            &plaintext,
            &self.settings.kdf,
            self.settings.aead,
        )?;

        let encoded = String::from_utf8(codec::serialize(&payload)?)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        db.set_meta(SNAPSHOT_META_KEY, &encoded)?;

        self.master_key = Some(key);
        info!("Created new vault");
        Ok(UnlockOutcome {
            created: true,
            snapshot,
        })
    }

    fn open_vault(&mut self, password: &[u8], stored: &str) -> Result<UnlockOutcome> {
        let payload = codec::deserialize(stored.as_bytes())?;
        if password.is_empty() {
            return Err(Error::InvalidCredentials);
        }

        let (plaintext, key) = match envelope::open_with_password(&payload, password) {
            Ok(opened) => opened,
            Err(Error::Authentication) => {
                warn!("Unlock failed");
                return Err(Error::InvalidCredentials);
            }
            Err(e) => return Err(e),
        };

        let snapshot = SnapshotBody::from_json(plaintext.as_bytes())?;
        self.master_key = Some(key);
        Ok(UnlockOutcome {
            created: false,
            snapshot,
        })
    }

    fn check_password_policy(&self, password: &[u8], confirm: Option<&[u8]>) -> Result<()> {
        let len = String::from_utf8_lossy(password).chars().count();
        if len < self.settings.min_password_len {
            return Err(Error::PasswordPolicy(format!(
                "password must be at least {} characters",
                self.settings.min_password_len
            )));
        }
        if let Some(confirm) = confirm {
            if confirm != password {
                return Err(Error::PasswordPolicy(
                    "passwords do not match".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Drop the master key and all cached plaintext. Safe to call when
    /// already locked.
    pub fn lock(&mut self) {
        let was_unlocked = self.master_key.take().is_some();
        self.content_cache.clear();
        if was_unlocked {
            info!("Vault locked");
        }
    }

    /// Master key of the unlocked session.
    ///
    /// # Errors
    /// - `Locked` if the session is locked
    pub fn master_key(&self) -> Result<&MasterKey> {
        self.master_key.as_ref().ok_or(Error::Locked)
    }

    pub fn record_activity(&mut self) {
        self.record_activity_at(Utc::now());
    }

    pub fn record_activity_at(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    /// Lock if the session has been idle for longer than the auto-lock
    /// timeout. Returns whether this call locked the session.
    pub fn check_auto_lock(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_unlocked() {
            return false;
        }
        let Some(timeout) = i64::try_from(self.settings.auto_lock_timeout_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
        else {
            return false;
        };
        if now - self.last_activity_at > timeout {
            debug!(idle_ms = (now - self.last_activity_at).num_milliseconds(), "Auto-lock");
            self.lock();
            true
        } else {
            false
        }
    }

    /// Remember a decrypted note body until the session locks.
    pub fn cache_content(&mut self, id: &NoteId, content: &str) {
        if self.is_unlocked() {
            self.content_cache
                .insert(id.clone(), Zeroizing::new(content.to_string()));
        }
    }

    pub fn cached_content(&self, id: &NoteId) -> Option<&str> {
        self.content_cache.get(id).map(|s| s.as_str())
    }

    pub fn evict_content(&mut self, id: &NoteId) {
        self.content_cache.remove(id);
    }

    /// Number of cached note bodies.
    pub fn cached_len(&self) -> usize {
        self.content_cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(timeout_ms: u64) -> SessionManager {
        SessionManager::new(VaultSettings::testing().with_auto_lock_timeout_ms(timeout_ms))
    }

    #[test]
    fn test_starts_locked() {
        let session = session(1000);
        assert_eq!(session.state(), LockState::Locked);
        assert!(matches!(session.master_key(), Err(Error::Locked)));
    }

    #[test]
    fn test_first_run_then_unlock() {
        let db = Database::in_memory().unwrap();
        let mut session = session(1000);

        let outcome = session.unlock(b"Secret123", None, &db).unwrap();
        assert!(outcome.created);
        assert!(session.is_unlocked());
        let first_key = session.master_key().unwrap().clone();

        session.lock();
        assert_eq!(session.state(), LockState::Locked);

        let outcome = session.unlock(b"Secret123", None, &db).unwrap();
        assert!(!outcome.created);
        assert!(session.master_key().unwrap().ct_eq(&first_key));
    }

    #[test]
    fn test_wrong_password_stays_locked() {
        let db = Database::in_memory().unwrap();
        let mut session = session(1000);
        session.unlock(b"Secret123", None, &db).unwrap();
        session.lock();

        let result = session.unlock(b"wrong-password", None, &db);
        assert!(matches!(result, Err(Error::InvalidCredentials)));
        assert!(!session.is_unlocked());

        let result = session.unlock(b"", None, &db);
        assert!(matches!(result, Err(Error::InvalidCredentials)));
    }

    #[test]
    fn test_first_run_policy() {
        let db = Database::in_memory().unwrap();
        let mut session = session(1000);

        assert!(matches!(
            session.unlock(b"abc", None, &db),
            Err(Error::PasswordPolicy(_))
        ));
        assert!(matches!(
            session.unlock(b"Secret123", Some(&b"Secret124"[..]), &db),
            Err(Error::PasswordPolicy(_))
        ));
        assert!(db.meta(SNAPSHOT_META_KEY).unwrap().is_none());

        session.unlock(b"Secret123", Some(&b"Secret123"[..]), &db).unwrap();
        assert!(db.meta(SNAPSHOT_META_KEY).unwrap().is_some());
    }

    #[test]
    fn test_auto_lock_threshold() {
        let db = Database::in_memory().unwrap();
        let t0 = Utc::now();

        let mut session = session(1000);
        session.unlock_at(b"Secret123", None, &db, t0).unwrap();
        session.record_activity_at(t0);

        assert!(!session.check_auto_lock(t0 + Duration::milliseconds(500)));
        assert!(session.is_unlocked());
        assert!(!session.check_auto_lock(t0 + Duration::milliseconds(1000)));

        assert!(session.check_auto_lock(t0 + Duration::milliseconds(1500)));
        assert!(!session.is_unlocked());
        assert!(!session.check_auto_lock(t0 + Duration::milliseconds(5000)));
    }

    #[test]
    fn test_huge_timeout_never_locks_early() {
        let db = Database::in_memory().unwrap();
        let t0 = Utc::now();

        for timeout in [i64::MAX as u64 + 1, u64::MAX] {
            let mut session = session(timeout);
            session.unlock_at(b"Secret123", None, &db, t0).unwrap();
            assert!(!session.check_auto_lock(t0 + Duration::milliseconds(1)));
            assert!(!session.check_auto_lock(t0 + Duration::days(365)));
            assert!(session.is_unlocked());
        }
    }

    #[test]
    fn test_failed_reunlock_drops_key() {
        let db = Database::in_memory().unwrap();
        let mut session = session(1000);
        session.unlock(b"Secret123", None, &db).unwrap();
        session.cache_content(&NoteId::generate(), "body");

        let result = session.unlock(b"wrong-password", None, &db);
        assert!(matches!(result, Err(Error::InvalidCredentials)));
        assert_eq!(session.state(), LockState::Locked);
        assert_eq!(session.cached_len(), 0);

        session.unlock(b"Secret123", None, &db).unwrap();
        assert!(session.is_unlocked());
    }

    #[test]
    fn test_activity_postpones_auto_lock() {
        let db = Database::in_memory().unwrap();
        let t0 = Utc::now();

        let mut session = session(1000);
        session.unlock_at(b"Secret123", None, &db, t0).unwrap();
        session.record_activity_at(t0 + Duration::milliseconds(900));
        assert!(!session.check_auto_lock(t0 + Duration::milliseconds(1500)));
    }

    #[test]
    fn test_lock_clears_cache() {
        let db = Database::in_memory().unwrap();
        let mut session = session(1000);
        let id = NoteId::generate();

        session.cache_content(&id, "ignored while locked");
        assert_eq!(session.cached_len(), 0);

        session.unlock(b"Secret123", None, &db).unwrap();
        session.cache_content(&id, "body");
        assert_eq!(session.cached_content(&id), Some("body"));

        session.lock();
        session.lock();
        assert_eq!(session.cached_len(), 0);
        assert!(session.cached_content(&id).is_none());
    }
}
