//! Record, attachment and change-notification types stored by the vault.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record type tag the interaction checker reads.
pub const MEDICATION_RECORD_TYPE: &str = "medication";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Content-derived attachment id (keyed hash, hex). Doubles as the file stem of
/// `attachments/<id>.enc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentId(String);

impl AttachmentId {
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are lowercase hex; anything else cannot name a file inside `attachments/`.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }
}

impl fmt::Display for AttachmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AttachmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One medical-history entry. `fields` belongs to the application's schema layer; the vault
/// only encrypts and returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub record_type: String,
    #[serde(default)]
    pub fields: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<AttachmentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub fn new(record_type: impl Into<String>, fields: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::generate(),
            record_type: record_type.into(),
            fields,
            attachments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentId) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Flattened text used by search and prompt building.
    pub fn searchable_text(&self) -> String {
        let mut out = self.record_type.clone();
        collect_strings(&self.fields, &mut out);
        out
    }
}

fn collect_strings(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => {
            out.push(' ');
            out.push_str(s);
        }
        serde_json::Value::Number(n) => {
            out.push(' ');
            out.push_str(&n.to_string());
        }
        serde_json::Value::Bool(b) => {
            out.push(' ');
            out.push_str(if *b { "true" } else { "false" });
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                out.push(' ');
                out.push_str(k);
                collect_strings(v, out);
            }
        }
        serde_json::Value::Null => {}
    }
}

/// Selection and ordering for `VaultStore::list_records`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub record_type: Option<String>,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of_type(record_type: impl Into<String>) -> Self {
        Self {
            record_type: Some(record_type.into()),
            ..Self::default()
        }
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// True when matching requires decrypting the record.
    pub(crate) fn needs_content(&self) -> bool {
        self.record_type.is_some()
    }

    pub(crate) fn matches(&self, record: &Record) -> bool {
        match &self.record_type {
            Some(t) => record.record_type.eq_ignore_ascii_case(t),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
}

/// Emitted after every committed record write. `epoch` increases by one per write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordChange {
    pub record_id: RecordId,
    pub kind: ChangeKind,
    pub epoch: u64,
}
