//! Whole-vault snapshot body.
//!
//! The canonical snapshot is a password payload whose plaintext is a
//! [`SnapshotBody`]. It bootstraps unlock, fixes the vault salt, and is the
//! format of exported backups.
//!
//! Bodies written by the earlier browser vault are a bare JSON array of
//! notes with numeric ids and a `text` field; they are normalized here.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use notevault_common::{Error, NoteId, Result};
use notevault_storage::{parse_tags, Note, NoteContent, NoteDraft};

/// Metadata key of the canonical snapshot payload.
pub const SNAPSHOT_META_KEY: &str = "snapshot";

/// Metadata key set when the snapshot's notes still have to be written to
/// the record store on the next unlock.
pub const HYDRATE_META_KEY: &str = "hydrate_pending";

/// Decrypted snapshot contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BodyRepr", rename_all = "camelCase")]
pub struct SnapshotBody {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub exported_at: DateTime<Utc>,
    pub notes: Vec<SnapshotNote>,
}

/// One note inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSnapshotNote", rename_all = "camelCase")]
pub struct SnapshotNote {
    pub id: NoteId,
    pub content: String,
    pub tags: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub pinned: bool,
    pub archived: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BodyRepr {
    Legacy(Vec<SnapshotNote>),
    Current {
        #[serde(default, alias = "exported_at", rename = "exportedAt")]
        exported_at: Option<i64>,
        #[serde(default)]
        notes: Vec<SnapshotNote>,
    },
}

impl From<BodyRepr> for SnapshotBody {
    fn from(repr: BodyRepr) -> Self {
        match repr {
            BodyRepr::Legacy(notes) => Self {
                exported_at: Utc::now(),
                notes,
            },
            BodyRepr::Current { exported_at, notes } => Self {
                exported_at: exported_at
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .unwrap_or_else(Utc::now),
                notes,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTags {
    List(Vec<String>),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshotNote {
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default, alias = "text")]
    content: Option<String>,
    #[serde(default)]
    tags: Option<RawTags>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    pinned: Option<bool>,
    #[serde(default)]
    archived: Option<bool>,
    #[serde(default, alias = "created_at")]
    created_at: Option<i64>,
    #[serde(default, alias = "updated_at")]
    updated_at: Option<i64>,
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

impl TryFrom<RawSnapshotNote> for SnapshotNote {
    type Error = Error;

    fn try_from(raw: RawSnapshotNote) -> Result<Self> {
        let content = raw
            .content
            .ok_or_else(|| Error::MalformedPayload("snapshot note without content".to_string()))?;

        // Browser vault ids were creation times in epoch milliseconds.
        let (id, id_time) = match raw.id {
            Some(RawId::Text(id)) => (NoteId::new(id)?, None),
            Some(RawId::Number(n)) => (NoteId::new(n.to_string())?, from_millis(Some(n))),
            None => (NoteId::generate(), None),
        };

        let tags = match raw.tags {
            Some(RawTags::List(list)) => list
                .iter()
                .map(|tag| tag.trim())
                .filter(|tag| !tag.is_empty())
                .map(str::to_string)
                .collect(),
            Some(RawTags::Text(text)) => parse_tags(&text),
            None => BTreeSet::new(),
        };

        let created_at = from_millis(raw.created_at)
            .or(id_time)
            .unwrap_or_else(Utc::now);
        let updated_at = from_millis(raw.updated_at).unwrap_or(created_at);

        Ok(Self {
            id,
            content,
            tags,
            color: raw.color,
            pinned: raw.pinned.unwrap_or(false),
            archived: raw.archived.unwrap_or(false),
            created_at,
            updated_at,
        })
    }
}

impl SnapshotNote {
    /// Draft for writing this note into the record store.
    pub fn to_draft(&self) -> NoteDraft {
        NoteDraft {
            id: self.id.clone(),
            content: self.content.clone(),
            tags: self.tags.clone(),
            color: self.color.clone(),
            pinned: self.pinned,
            archived: self.archived,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl SnapshotBody {
    pub fn empty() -> Self {
        Self {
            exported_at: Utc::now(),
            notes: Vec::new(),
        }
    }

    /// Snapshot of the given notes. Undecryptable notes are left out.
    pub fn from_notes<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let notes = notes
            .into_iter()
            .filter_map(|note| match &note.content {
                NoteContent::Text(text) => Some(SnapshotNote {
                    id: note.id.clone(),
                    content: text.clone(),
                    tags: note.tags.clone(),
                    color: note.color.clone(),
                    pinned: note.pinned,
                    archived: note.archived,
                    created_at: note.created_at,
                    updated_at: note.updated_at,
                }),
                NoteContent::Undecryptable => None,
            })
            .collect();

        Self {
            exported_at: Utc::now(),
            notes,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse decrypted snapshot plaintext.
    ///
    /// # Errors
    /// - `MalformedPayload` if the plaintext is not a snapshot body
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedPayload(format!("snapshot body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_roundtrip() {
        let body = SnapshotBody {
            exported_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            notes: vec![SnapshotNote {
                id: NoteId::new("abc").unwrap(),
                content: "hello".to_string(),
                tags: parse_tags("a,b"),
                color: Some("#fff".to_string()),
                pinned: true,
                archived: false,
                created_at: Utc.timestamp_millis_opt(1_600_000_000_000).unwrap(),
                updated_at: Utc.timestamp_millis_opt(1_650_000_000_000).unwrap(),
            }],
        };

        let json = body.to_json().unwrap();
        let text = String::from_utf8(json.clone()).unwrap();
        assert!(text.contains("\"exportedAt\""));
        assert!(text.contains("\"createdAt\""));

        assert_eq!(SnapshotBody::from_json(&json).unwrap(), body);
    }

    #[test]
    fn test_legacy_array_body() {
        let json = br#"[
            {"id": 1700000000000, "text": "legacy note", "tags": ["work", " "], "archived": true},
            {"id": "x1", "content": "other", "tags": "a, b"}
        ]"#;
        let body = SnapshotBody::from_json(json).unwrap();
        assert_eq!(body.notes.len(), 2);

        let first = &body.notes[0];
        assert_eq!(first.id.as_str(), "1700000000000");
        assert_eq!(first.content, "legacy note");
        assert_eq!(first.tags, parse_tags("work"));
        assert!(first.archived);
        assert!(!first.pinned);
        assert_eq!(first.created_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(first.updated_at, first.created_at);

        assert_eq!(body.notes[1].tags, parse_tags("a,b"));
    }

    #[test]
    fn test_empty_legacy_body() {
        let body = SnapshotBody::from_json(b"[]").unwrap();
        assert!(body.notes.is_empty());
    }

    #[test]
    fn test_note_without_content_rejected() {
        let result = SnapshotBody::from_json(br#"[{"id": 1, "tags": []}]"#);
        assert!(matches!(result, Err(Error::MalformedPayload(_))));
    }

    #[test]
    fn test_from_notes_skips_undecryptable() {
        let now = Utc::now();
        let note = |content| Note {
            id: NoteId::generate(),
            content,
            tags: BTreeSet::new(),
            color: None,
            pinned: false,
            archived: false,
            created_at: now,
            updated_at: now,
            synced: false,
        };
        let notes = vec![
            note(NoteContent::Text("kept".to_string())),
            note(NoteContent::Undecryptable),
        ];

        let body = SnapshotBody::from_notes(&notes);
        assert_eq!(body.notes.len(), 1);
        assert_eq!(body.notes[0].content, "kept");
    }
}
