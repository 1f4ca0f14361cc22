//! **BackupManager**: Snapshots and restores the vault's sealed bytes.
//!
//! A snapshot is the exact ciphertext of every record and attachment plus the key-derivation
//! parameters (no secret) and a manifest with per-entry SHA-256 digests and a checksum over
//! the whole set. Nothing here decrypts: backups can be copied off the device without
//! exposing medical data.
//!
//! Restore verifies everything before it touches disk. Any digest, checksum, or key
//! fingerprint mismatch returns `BackupIntegrity` and leaves the vault as it was.

use crate::atomic_file;
use crate::config::PhaitConfig;
use crate::crypto::{KeyFingerprint, KeyParams};
use crate::error::{PhaitError, PhaitResult};
use crate::vault::{AttachmentId, RecordId, VaultStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::sync::Arc;

pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Record,
    Attachment,
}

/// One sealed blob, byte-for-byte as the vault stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub kind: EntryKind,
    pub id: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`.
    pub sha256: String,
}

impl BackupEntry {
    fn new(kind: EntryKind, id: String, bytes: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Self {
            kind,
            id,
            bytes,
            sha256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub record_ids: Vec<RecordId>,
    pub attachment_ids: Vec<AttachmentId>,
    pub key_fingerprint: KeyFingerprint,
    /// Hex SHA-256 over the fingerprint and every entry's kind, id and digest, in order.
    pub checksum: String,
}

/// Opaque, fully encrypted copy of a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub manifest: BackupManifest,
    pub key_params: KeyParams,
    pub entries: Vec<BackupEntry>,
}

fn set_checksum(fingerprint: &KeyFingerprint, entries: &[BackupEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"phait:backup:v1");
    hasher.update(fingerprint.0.as_bytes());
    for entry in entries {
        hasher.update([match entry.kind {
            EntryKind::Record => 1u8,
            EntryKind::Attachment => 2u8,
        }]);
        hasher.update((entry.id.len() as u64).to_be_bytes());
        hasher.update(entry.id.as_bytes());
        hasher.update(entry.sha256.as_bytes());
    }
    hex::encode(hasher.finalize())
}

impl BackupSnapshot {
    fn build(
        key_params: KeyParams,
        records: Vec<(RecordId, Vec<u8>)>,
        attachments: Vec<(AttachmentId, Vec<u8>)>,
    ) -> Self {
        let key_fingerprint = key_params.fingerprint();
        let record_ids: Vec<RecordId> = records.iter().map(|(id, _)| id.clone()).collect();
        let attachment_ids: Vec<AttachmentId> =
            attachments.iter().map(|(id, _)| id.clone()).collect();

        let mut entries = Vec::with_capacity(records.len() + attachments.len());
        for (id, bytes) in records {
            entries.push(BackupEntry::new(EntryKind::Record, id.to_string(), bytes));
        }
        for (id, bytes) in attachments {
            entries.push(BackupEntry::new(EntryKind::Attachment, id.to_string(), bytes));
        }
        let checksum = set_checksum(&key_fingerprint, &entries);

        Self {
            manifest: BackupManifest {
                format_version: BACKUP_FORMAT_VERSION,
                created_at: Utc::now(),
                record_ids,
                attachment_ids,
                key_fingerprint,
                checksum,
            },
            key_params,
            entries,
        }
    }

    /// Check version, key fingerprint, every entry digest, the manifest id lists and the
    /// overall checksum. Touches nothing on disk.
    pub fn verify(&self) -> PhaitResult<()> {
        let m = &self.manifest;
        if m.format_version != BACKUP_FORMAT_VERSION {
            return Err(PhaitError::BackupIntegrity(format!(
                "unsupported backup format version {}",
                m.format_version
            )));
        }
        if self.key_params.fingerprint() != m.key_fingerprint {
            return Err(PhaitError::BackupIntegrity(
                "key parameters do not match the manifest fingerprint".into(),
            ));
        }

        let mut record_ids = Vec::new();
        let mut attachment_ids = Vec::new();
        for entry in &self.entries {
            let actual = hex::encode(Sha256::digest(&entry.bytes));
            if actual != entry.sha256 {
                return Err(PhaitError::BackupIntegrity(format!(
                    "checksum mismatch for {:?} {}",
                    entry.kind, entry.id
                )));
            }
            match entry.kind {
                EntryKind::Record => record_ids.push(RecordId::from(entry.id.as_str())),
                EntryKind::Attachment => {
                    let id = AttachmentId::from(entry.id.as_str());
                    if !id.is_well_formed() {
                        return Err(PhaitError::BackupIntegrity(format!(
                            "malformed attachment id {:?}",
                            entry.id
                        )));
                    }
                    attachment_ids.push(id);
                }
            }
        }
        if record_ids != m.record_ids || attachment_ids != m.attachment_ids {
            return Err(PhaitError::BackupIntegrity(
                "manifest ids do not match the entries".into(),
            ));
        }
        if set_checksum(&m.key_fingerprint, &self.entries) != m.checksum {
            return Err(PhaitError::BackupIntegrity("manifest checksum mismatch".into()));
        }
        Ok(())
    }

    fn split(&self) -> (Vec<(RecordId, Vec<u8>)>, Vec<(AttachmentId, Vec<u8>)>) {
        let mut records = Vec::new();
        let mut attachments = Vec::new();
        for entry in &self.entries {
            match entry.kind {
                EntryKind::Record => {
                    records.push((RecordId::from(entry.id.as_str()), entry.bytes.clone()))
                }
                EntryKind::Attachment => attachments
                    .push((AttachmentId::from(entry.id.as_str()), entry.bytes.clone())),
            }
        }
        (records, attachments)
    }

    pub fn to_json(&self) -> PhaitResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a stored snapshot. Unparseable input is an integrity failure, not a crash.
    pub fn from_json(bytes: &[u8]) -> PhaitResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| PhaitError::BackupIntegrity(format!("unreadable backup: {}", e)))
    }
}

fn validate_backup_name(name: &str) -> PhaitResult<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(PhaitError::Config(format!("invalid backup name {:?}", name)))
    }
}

/// Snapshot / restore over one open vault.
#[derive(Debug, Clone)]
pub struct BackupManager {
    store: Arc<VaultStore>,
}

impl BackupManager {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Copy every sealed blob while holding the write gate.
    pub fn snapshot(&self) -> PhaitResult<BackupSnapshot> {
        let gate = self.store.lock_writes()?;
        let records = self.store.raw_records(&gate)?;
        let attachments = self.store.raw_attachments(&gate)?;
        let key_params = self.store.key_params()?;
        drop(gate);

        let snapshot = BackupSnapshot::build(key_params, records, attachments);
        tracing::info!(
            target: "phait::backup",
            records = snapshot.manifest.record_ids.len(),
            attachments = snapshot.manifest.attachment_ids.len(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// Replace the vault contents with `snapshot`. All-or-nothing.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> PhaitResult<()> {
        if let Err(e) = snapshot.verify() {
            tracing::warn!(target: "phait::backup", error = %e, "restore refused");
            return Err(e);
        }
        let current = self.store.key_fingerprint()?;
        if current != snapshot.manifest.key_fingerprint {
            tracing::warn!(target: "phait::backup", "restore refused: snapshot sealed under another key");
            return Err(PhaitError::BackupIntegrity(
                "snapshot was taken under a different vault key".into(),
            ));
        }

        let (records, attachments) = snapshot.split();
        let gate = self.store.lock_writes()?;
        self.store.replace_all_raw(&gate, &records, &attachments)?;
        drop(gate);

        tracing::info!(
            target: "phait::backup",
            records = records.len(),
            attachments = attachments.len(),
            "snapshot restored"
        );
        Ok(())
    }

    /// Snapshot and persist under `backups/<name>`.
    pub fn create_named(&self, name: &str) -> PhaitResult<BackupManifest> {
        validate_backup_name(name)?;
        let snapshot = self.snapshot()?;
        let path = self.store.config().backup_path(name);
        atomic_file::write_atomic(&path, &snapshot.to_json()?)?;
        tracing::info!(target: "phait::backup", name, path = %path.display(), "backup written");
        Ok(snapshot.manifest)
    }

    pub fn load_named(&self, name: &str) -> PhaitResult<BackupSnapshot> {
        load_named(self.store.config(), name)
    }

    /// Names under `backups/`, sorted.
    pub fn list_backups(&self) -> PhaitResult<Vec<String>> {
        let dir = self.store.config().backup_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_backup_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Rebuild a vault in an empty base directory from `snapshot`, then open it with
    /// `secret`. The secret is only checked against the restored key parameters.
    pub fn restore_into(
        config: PhaitConfig,
        snapshot: &BackupSnapshot,
        secret: &str,
    ) -> PhaitResult<Arc<VaultStore>> {
        snapshot.verify()?;
        let key_path = config.key_path();
        if key_path.exists() || config.db_path().exists() {
            return Err(PhaitError::Config(format!(
                "{} already holds a vault",
                config.base_dir.display()
            )));
        }
        config.ensure_directories()?;
        snapshot.key_params.save(&key_path)?;

        let store = match VaultStore::open(config, secret) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                let _ = fs::remove_file(&key_path);
                return Err(e);
            }
        };
        BackupManager::new(Arc::clone(&store)).restore(snapshot)?;
        Ok(store)
    }
}

fn load_named(config: &PhaitConfig, name: &str) -> PhaitResult<BackupSnapshot> {
    validate_backup_name(name)?;
    let path = config.backup_path(name);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PhaitError::not_found("backup", name))
        }
        Err(e) => return Err(e.into()),
    };
    BackupSnapshot::from_json(&bytes)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        B64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
