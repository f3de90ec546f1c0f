//! Note model.
//!
//! A [`NoteRecord`] is what sits on disk: ciphertext plus plaintext metadata.
//! A [`Note`] is the decrypted view handed out while the vault is unlocked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

use notevault_common::NoteId;
use notevault_crypto::{envelope, EncryptedPayload, MasterKey};

/// Decrypted content of a note.
#[derive(Clone, PartialEq, Eq)]
pub enum NoteContent {
    /// Plaintext body.
    Text(String),
    /// The stored ciphertext did not verify under the current key.
    Undecryptable,
}

impl NoteContent {
    /// Plaintext body, if the note could be decrypted.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            NoteContent::Text(text) => Some(text),
            NoteContent::Undecryptable => None,
        }
    }

    /// Whether decryption failed for this note.
    pub fn is_undecryptable(&self) -> bool {
        matches!(self, NoteContent::Undecryptable)
    }
}

impl fmt::Debug for NoteContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteContent::Text(text) => write!(f, "Text([REDACTED; {} bytes])", text.len()),
            NoteContent::Undecryptable => write!(f, "Undecryptable"),
        }
    }
}

/// A decrypted note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: NoteId,
    pub content: NoteContent,
    pub tags: BTreeSet<String>,
    pub color: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// All queued operations for this note have been acknowledged.
    pub synced: bool,
}

/// A note as persisted: content is only ever ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRecord {
    pub id: NoteId,
    pub content: EncryptedPayload,
    pub tags: BTreeSet<String>,
    pub color: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
}

impl NoteRecord {
    /// Decrypt the record. A payload that fails to open yields
    /// [`NoteContent::Undecryptable`] rather than an error.
    pub fn decrypt(self, key: &MasterKey) -> Note {
        let content = match envelope::open_with_key(key, &self.content) {
            Ok(plaintext) => match String::from_utf8(plaintext.as_bytes().to_vec()) {
                Ok(text) => NoteContent::Text(text),
                Err(_) => {
                    warn!(note_id = %self.id, "Note content is not valid UTF-8");
                    NoteContent::Undecryptable
                }
            },
            Err(_) => {
                warn!(note_id = %self.id, "Note content failed to decrypt");
                NoteContent::Undecryptable
            }
        };

        Note {
            id: self.id,
            content,
            tags: self.tags,
            color: self.color,
            pinned: self.pinned,
            archived: self.archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
            synced: self.synced,
        }
    }
}

/// Input for creating a note with explicit identity and timestamps, used when
/// materializing notes from a snapshot.
#[derive(Debug, Clone)]
pub struct NoteDraft {
    pub id: NoteId,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub color: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NoteDraft {
    /// A new note with a fresh id, stamped now.
    pub fn new(content: impl Into<String>, tags: BTreeSet<String>, color: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: NoteId::generate(),
            content: content.into(),
            tags,
            color,
            pinned: false,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update of a note. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoteUpdate {
    pub content: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    /// `Some(None)` clears the color.
    pub color: Option<Option<String>>,
    pub pinned: Option<bool>,
    pub archived: Option<bool>,
}

impl NoteUpdate {
    /// Replace the content.
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Set the archived flag.
    pub fn archived(archived: bool) -> Self {
        Self {
            archived: Some(archived),
            ..Self::default()
        }
    }

    /// Set the pinned flag.
    pub fn pinned(pinned: bool) -> Self {
        Self {
            pinned: Some(pinned),
            ..Self::default()
        }
    }

    /// Replace the tag set.
    pub fn tags(tags: BTreeSet<String>) -> Self {
        Self {
            tags: Some(tags),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Changed fields carried by a queued CREATE or UPDATE operation.
///
/// Never contains plaintext: content travels as its encrypted payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<EncryptedPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
    /// `Some(None)` clears the color; it travels as `"color": null`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_field"
    )]
    pub color: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A field that is present deserializes to `Some`, even when it is `null`.
/// Absent fields fall back to `None` through `#[serde(default)]`.
fn present_field<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl NotePatch {
    /// Apply the fields set in `later` on top of this patch.
    pub fn merge(&mut self, later: NotePatch) {
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.tags.is_some() {
            self.tags = later.tags;
        }
        if later.color.is_some() {
            self.color = later.color;
        }
        if later.pinned.is_some() {
            self.pinned = later.pinned;
        }
        if later.archived.is_some() {
            self.archived = later.archived;
        }
        if later.created_at.is_some() {
            self.created_at = later.created_at;
        }
        if later.updated_at.is_some() {
            self.updated_at = later.updated_at;
        }
    }

    /// Full patch describing a freshly created record.
    pub fn full(record: &NoteRecord) -> Self {
        Self {
            content: Some(record.content.clone()),
            tags: Some(record.tags.clone()),
            color: Some(record.color.clone()),
            pinned: Some(record.pinned),
            archived: Some(record.archived),
            created_at: Some(record.created_at),
            updated_at: Some(record.updated_at),
        }
    }
}

/// Split comma separated tag input into a normalized set.
///
/// Tags are trimmed; empty entries are dropped.
pub fn parse_tags(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}
