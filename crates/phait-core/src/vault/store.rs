//! **VaultStore**: Encrypted persistence for medical records and attachments.
//!
//! Records live in a sled database (`data/medical_vault.db`) as sealed blobs keyed by record
//! id; attachments live one file per id under `attachments/<id>.enc`. Nothing but ciphertext
//! ever reaches disk. Each blob's associated data binds it to its id, so swapping two stored
//! blobs is detected as tampering.
//!
//! Writes are serialized by a single write gate; reads never take it. A sled transaction
//! (records) or temp-file + rename (attachments) makes every write all-or-nothing, so a
//! reader observes either the previous or the new blob.

use super::record::{
    AttachmentId, ChangeKind, Record, RecordChange, RecordFilter, RecordId,
};
use crate::atomic_file;
use crate::config::PhaitConfig;
use crate::crypto::{CipherCodec, KeyFingerprint, KeyManager, KeyParams, MasterKey};
use crate::error::{PhaitError, PhaitResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use zeroize::Zeroizing;

const RECORDS_TREE: &str = "records";
const ORDER_TREE: &str = "record_order";
const POSITIONS_TREE: &str = "record_positions";
const CHANGE_CHANNEL_CAPACITY: usize = 1024;
const ATTACHMENT_ID_LEN: usize = 16;
const ATTACHMENT_ID_DOMAIN: &[u8] = b"phait:attachment-id:v1";
const ATTACHMENT_EXT: &str = "enc";

type HmacSha256 = Hmac<Sha256>;

fn record_aad(id: &RecordId) -> Vec<u8> {
    format!("phait:record:{}", id).into_bytes()
}

fn attachment_aad(id: &AttachmentId) -> Vec<u8> {
    format!("phait:attachment:{}", id).into_bytes()
}

/// Proof that the caller holds the vault's single-writer lock.
pub(crate) struct WriteGate<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

/// Encrypted record + attachment store for one open vault.
pub struct VaultStore {
    config: PhaitConfig,
    keys: RwLock<KeyManager>,
    codec: CipherCodec,
    db: sled::Db,
    records: sled::Tree,
    order: sled::Tree,
    positions: sled::Tree,
    write_gate: Mutex<()>,
    epoch: AtomicU64,
    changes: broadcast::Sender<RecordChange>,
}

impl VaultStore {
    /// Open (or create) the vault under `config.base_dir` with the user's secret.
    pub fn open(config: PhaitConfig, secret: &str) -> PhaitResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let swept = atomic_file::sweep_temp_files(&config.attachments_dir())?
            + atomic_file::sweep_temp_files(&config.data_dir())?;
        if swept > 0 {
            tracing::warn!(
                target: "phait::vault",
                swept,
                "removed leftovers of interrupted writes"
            );
        }

        let keys = KeyManager::open(&config, secret)?;
        let codec = CipherCodec::new(config.algorithm()?);
        let db = sled::open(config.db_path())?;
        let records = db.open_tree(RECORDS_TREE)?;
        let order = db.open_tree(ORDER_TREE)?;
        let positions = db.open_tree(POSITIONS_TREE)?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        tracing::info!(
            target: "phait::vault",
            base_dir = %config.base_dir.display(),
            records = positions.len(),
            algorithm = %codec.algorithm(),
            "vault opened"
        );

        Ok(Self {
            config,
            keys: RwLock::new(keys),
            codec,
            db,
            records,
            order,
            positions,
            write_gate: Mutex::new(()),
            epoch: AtomicU64::new(0),
            changes,
        })
    }

    pub fn config(&self) -> &PhaitConfig {
        &self.config
    }

    /// Wipe the master key. The store stays readable only as ciphertext afterwards.
    pub fn close(&self) -> PhaitResult<()> {
        let _gate = self.lock_writes()?;
        self.db.flush()?;
        self.keys
            .write()
            .map_err(|_| PhaitError::Storage("key lock poisoned".into()))?
            .close();
        tracing::info!(target: "phait::vault", "vault closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.keys.read().map(|k| k.is_open()).unwrap_or(false)
    }

    /// Borrow the master key for the duration of `f` only.
    fn with_key<T>(&self, f: impl FnOnce(&MasterKey) -> PhaitResult<T>) -> PhaitResult<T> {
        let keys = self
            .keys
            .read()
            .map_err(|_| PhaitError::Storage("key lock poisoned".into()))?;
        f(keys.key()?)
    }

    pub(crate) fn lock_writes(&self) -> PhaitResult<WriteGate<'_>> {
        self.write_gate
            .lock()
            .map(WriteGate)
            .map_err(|_| PhaitError::Storage("write gate poisoned".into()))
    }

    // ---------------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------------

    /// Insert or replace a record. Replacing keeps the record's insertion position.
    pub fn put_record(&self, record: &Record) -> PhaitResult<RecordId> {
        let id = record.id.clone();
        if id.as_str().is_empty() {
            return Err(PhaitError::Config("record id must not be empty".into()));
        }
        let plain = Zeroizing::new(serde_json::to_vec(record)?);
        let blob = self.with_key(|key| self.codec.encrypt(key, &plain, &record_aad(&id)))?;
        let bytes = blob.to_bytes();

        let _gate = self.lock_writes()?;
        let is_new = !self.positions.contains_key(id.as_str().as_bytes())?;
        let seq = if is_new { Some(self.db.generate_id()?) } else { None };

        let result: Result<(), TransactionError<()>> =
            (&self.records, &self.order, &self.positions).transaction(
                |(records, order, positions)| -> ConflictableTransactionResult<(), ()> {
                    records.insert(id.as_str().as_bytes(), bytes.as_slice())?;
                    if let Some(seq) = seq {
                        order.insert(seq.to_be_bytes().to_vec(), id.as_str().as_bytes())?;
                        positions.insert(id.as_str().as_bytes(), seq.to_be_bytes().to_vec())?;
                    }
                    Ok(())
                },
            );
        map_tx(result)?;
        self.db.flush()?;

        let kind = if is_new {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        };
        self.publish(id.clone(), kind);
        tracing::debug!(
            target: "phait::vault",
            record_id = %id,
            ?kind,
            bytes = bytes.len(),
            "record stored"
        );
        Ok(id)
    }

    pub fn get_record(&self, id: &RecordId) -> PhaitResult<Record> {
        let stored = self
            .records
            .get(id.as_str().as_bytes())?
            .ok_or_else(|| PhaitError::not_found("record", id.as_str()))?;
        let plain = self
            .with_key(|key| self.codec.open_bytes(key, &stored, &record_aad(id)))
            .map_err(|e| {
                tracing::warn!(target: "phait::vault", record_id = %id, error = %e, "record failed to open");
                e
            })?;
        let record: Record = serde_json::from_slice(plain.as_slice())
            .map_err(|e| PhaitError::DecryptionFailed(format!("record {}: {}", id, e)))?;
        if record.id != *id {
            return Err(PhaitError::DecryptionFailed(format!(
                "record {} decrypted to a different id",
                id
            )));
        }
        Ok(record)
    }

    pub fn contains_record(&self, id: &RecordId) -> PhaitResult<bool> {
        Ok(self.positions.contains_key(id.as_str().as_bytes())?)
    }

    pub fn record_count(&self) -> usize {
        self.positions.len()
    }

    /// Lazily walk record ids in insertion order (or newest first), applying `filter`.
    pub fn list_records(&self, filter: RecordFilter) -> RecordIds<'_> {
        RecordIds {
            store: self,
            iter: self.order.iter(),
            filter,
            yielded: 0,
            done: false,
        }
    }

    // ---------------------------------------------------------------------
    // Attachments
    // ---------------------------------------------------------------------

    fn attachment_id_for(&self, content: &[u8]) -> PhaitResult<AttachmentId> {
        self.with_key(|key| {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(key.expose())
                .map_err(|e| PhaitError::Config(format!("attachment id key: {}", e)))?;
            mac.update(ATTACHMENT_ID_DOMAIN);
            mac.update(content);
            let digest = mac.finalize().into_bytes();
            Ok(AttachmentId::from_digest(&digest[..ATTACHMENT_ID_LEN]))
        })
    }

    fn attachment_path(&self, id: &AttachmentId) -> PhaitResult<PathBuf> {
        if !id.is_well_formed() {
            return Err(PhaitError::not_found("attachment", id.as_str()));
        }
        Ok(self.config.attachment_path(id.as_str()))
    }

    /// Encrypt and store `content`. Identical content yields the same id and one file; a
    /// stored file that no longer authenticates is re-sealed from the supplied content.
    pub fn put_attachment(&self, content: &[u8]) -> PhaitResult<AttachmentId> {
        let id = self.attachment_id_for(content)?;
        let path = self.attachment_path(&id)?;

        let _gate = self.lock_writes()?;
        if path.exists() {
            let stored = fs::read(&path)?;
            match self.with_key(|key| self.codec.open_bytes(key, &stored, &attachment_aad(&id))) {
                Ok(_) => {
                    tracing::debug!(target: "phait::vault", attachment_id = %id, "attachment already stored");
                    return Ok(id);
                }
                Err(PhaitError::AuthenticationFailure(reason)) => {
                    tracing::warn!(
                        target: "phait::vault",
                        attachment_id = %id,
                        reason = %reason,
                        "stored attachment is unreadable; replacing it with the supplied content"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let blob = self.with_key(|key| self.codec.encrypt(key, content, &attachment_aad(&id)))?;
        atomic_file::write_atomic(&path, &blob.to_bytes())?;
        tracing::debug!(
            target: "phait::vault",
            attachment_id = %id,
            bytes = content.len(),
            "attachment stored"
        );
        Ok(id)
    }

    pub fn get_attachment(&self, id: &AttachmentId) -> PhaitResult<Vec<u8>> {
        let path = self.attachment_path(id)?;
        let stored = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PhaitError::not_found("attachment", id.as_str()))
            }
            Err(e) => return Err(e.into()),
        };
        let plain = self
            .with_key(|key| self.codec.open_bytes(key, &stored, &attachment_aad(id)))
            .map_err(|e| {
                tracing::warn!(target: "phait::vault", attachment_id = %id, error = %e, "attachment failed to open");
                e
            })?;
        Ok(plain.to_vec())
    }

    pub fn has_attachment(&self, id: &AttachmentId) -> bool {
        self.attachment_path(id).map(|p| p.exists()).unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Change notification
    // ---------------------------------------------------------------------

    /// Number of record writes committed since this store was opened.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }

    fn publish(&self, record_id: RecordId, kind: ChangeKind) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is fine.
        let _ = self.changes.send(RecordChange {
            record_id,
            kind,
            epoch,
        });
    }

    // ---------------------------------------------------------------------
    // Raw ciphertext access for backups (never decrypts)
    // ---------------------------------------------------------------------

    pub fn key_params(&self) -> PhaitResult<KeyParams> {
        Ok(self
            .keys
            .read()
            .map_err(|_| PhaitError::Storage("key lock poisoned".into()))?
            .params()
            .clone())
    }

    pub fn key_fingerprint(&self) -> PhaitResult<KeyFingerprint> {
        Ok(self.key_params()?.fingerprint())
    }

    /// Sealed record blobs in insertion order.
    pub(crate) fn raw_records(&self, _gate: &WriteGate<'_>) -> PhaitResult<Vec<(RecordId, Vec<u8>)>> {
        let mut out = Vec::with_capacity(self.positions.len());
        for entry in self.order.iter() {
            let (_, id_bytes) = entry?;
            let id = RecordId::from(String::from_utf8_lossy(&id_bytes).to_string());
            let blob = self
                .records
                .get(&id_bytes)?
                .ok_or_else(|| PhaitError::Storage(format!("order index points at missing record {}", id)))?;
            out.push((id, blob.to_vec()));
        }
        Ok(out)
    }

    /// Sealed attachment files sorted by id.
    pub(crate) fn raw_attachments(
        &self,
        _gate: &WriteGate<'_>,
    ) -> PhaitResult<Vec<(AttachmentId, Vec<u8>)>> {
        let mut out = Vec::new();
        let dir = self.config.attachments_dir();
        if !dir.is_dir() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_blob = path.extension().map(|e| e == ATTACHMENT_EXT).unwrap_or(false);
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let id = AttachmentId::from(stem.as_str());
            if !is_blob || !id.is_well_formed() {
                continue;
            }
            out.push((id, fs::read(&path)?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Replace the whole store with the given sealed blobs.
    ///
    /// Snapshot attachments are published before the record trees swap, so a reader never
    /// sees a restored record whose attachment is missing. Ids are content-derived, so an
    /// extra file is harmless until the swap commits. On any failure before that point the
    /// newly published files are removed and the previous records stay in place. Attachments
    /// the snapshot does not carry are deleted only after the swap.
    pub(crate) fn replace_all_raw(
        &self,
        gate: &WriteGate<'_>,
        records: &[(RecordId, Vec<u8>)],
        attachments: &[(AttachmentId, Vec<u8>)],
    ) -> PhaitResult<()> {
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(attachments.len());
        for (id, bytes) in attachments {
            let staged_one = self
                .attachment_path(id)
                .and_then(|target| atomic_file::stage(&target, bytes).map(|tmp| (tmp, target)));
            match staged_one {
                Ok(pair) => staged.push(pair),
                Err(e) => {
                    discard_staged(&staged);
                    return Err(e);
                }
            }
        }

        let mut published: Vec<PathBuf> = Vec::new();
        for (i, (tmp, target)) in staged.iter().enumerate() {
            let existed = target.exists();
            if let Err(e) = atomic_file::commit(tmp, target) {
                tracing::warn!(target: "phait::vault", error = %e, "restore aborted while publishing attachments");
                discard_staged(&staged[i..]);
                remove_published(&published);
                return Err(e);
            }
            if !existed {
                published.push(target.clone());
            }
        }

        if let Err(e) = self.swap_record_trees(records) {
            tracing::warn!(target: "phait::vault", error = %e, "restore aborted; records unchanged");
            remove_published(&published);
            return Err(e);
        }
        self.db.flush()?;

        let keep: std::collections::HashSet<&AttachmentId> =
            attachments.iter().map(|(id, _)| id).collect();
        for (id, _) in self.raw_attachments(gate)? {
            if !keep.contains(&id) {
                let _ = fs::remove_file(self.config.attachment_path(id.as_str()));
            }
        }

        for (id, _) in records {
            self.publish(id.clone(), ChangeKind::Updated);
        }
        if records.is_empty() {
            // Emptied vault still invalidates anything derived from it.
            self.epoch.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drop every record and insert `records` in order, in one transaction.
    fn swap_record_trees(&self, records: &[(RecordId, Vec<u8>)]) -> PhaitResult<()> {
        let old_ids = self.positions.iter().keys().collect::<Result<Vec<sled::IVec>, sled::Error>>()?;
        let old_seqs = self.order.iter().keys().collect::<Result<Vec<sled::IVec>, sled::Error>>()?;
        let new_seqs = records
            .iter()
            .map(|_| self.db.generate_id())
            .collect::<Result<Vec<u64>, sled::Error>>()?;

        let result: Result<(), TransactionError<()>> =
            (&self.records, &self.order, &self.positions).transaction(
                |(tx_records, tx_order, tx_positions)| -> ConflictableTransactionResult<(), ()> {
                    for id in &old_ids {
                        tx_records.remove(id.clone())?;
                        tx_positions.remove(id.clone())?;
                    }
                    for seq in &old_seqs {
                        tx_order.remove(seq.clone())?;
                    }
                    for ((id, blob), seq) in records.iter().zip(&new_seqs) {
                        let key = id.as_str().as_bytes();
                        tx_records.insert(key, blob.as_slice())?;
                        tx_order.insert(seq.to_be_bytes().to_vec(), key)?;
                        tx_positions.insert(key, seq.to_be_bytes().to_vec())?;
                    }
                    Ok(())
                },
            );
        map_tx(result)
    }
}

fn discard_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        let _ = fs::remove_file(tmp);
    }
}

fn remove_published(published: &[PathBuf]) {
    for path in published {
        let _ = fs::remove_file(path);
    }
}

fn map_tx(result: Result<(), TransactionError<()>>) -> PhaitResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(TransactionError::Storage(e)) => Err(e.into()),
        Err(TransactionError::Abort(())) => Err(PhaitError::Storage("transaction aborted".into())),
    }
}

impl std::fmt::Debug for VaultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultStore")
            .field("base_dir", &self.config.base_dir)
            .field("records", &self.record_count())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Lazy, finite iterator over record ids. Filtering by record type decrypts each candidate.
pub struct RecordIds<'a> {
    store: &'a VaultStore,
    iter: sled::Iter,
    filter: RecordFilter,
    yielded: usize,
    done: bool,
}

impl Iterator for RecordIds<'_> {
    type Item = PhaitResult<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.filter.limit.is_some_and(|l| self.yielded >= l) {
                return None;
            }
            let next = if self.filter.newest_first {
                self.iter.next_back()
            } else {
                self.iter.next()
            };
            let (_, id_bytes) = match next? {
                Ok(kv) => kv,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let id = RecordId::from(String::from_utf8_lossy(&id_bytes).to_string());
            if self.filter.needs_content() {
                match self.store.get_record(&id) {
                    Ok(record) if self.filter.matches(&record) => {}
                    Ok(_) => continue,
                    Err(e) => return Some(Err(e)),
                }
            }
            self.yielded += 1;
            return Some(Ok(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store(dir: &std::path::Path) -> VaultStore {
        let mut cfg = PhaitConfig::with_base_dir(dir);
        cfg.key_derivation_iterations = 1_000;
        VaultStore::open(cfg, "x").unwrap()
    }

    #[test]
    fn record_roundtrip_and_update_keeps_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut a = Record::new("allergy", json!({"substance": "latex"}));
        let b = Record::new("condition", json!({"name": "asthma"}));
        store.put_record(&a).unwrap();
        store.put_record(&b).unwrap();

        a.fields = json!({"substance": "latex", "severity": "high"});
        store.put_record(&a).unwrap();

        let ids: Vec<RecordId> = store
            .list_records(RecordFilter::all())
            .collect::<PhaitResult<_>>()
            .unwrap();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);
        assert_eq!(store.get_record(&a.id).unwrap().fields["severity"], "high");
        assert_eq!(store.record_count(), 2);
        assert_eq!(store.epoch(), 3);
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.get_record(&RecordId::from("nope")),
            Err(PhaitError::NotFound { kind: "record", .. })
        ));
    }

    #[test]
    fn record_bytes_on_disk_are_not_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let r = Record::new("note", json!({"text": "HIV-negative-marker-string"}));
        store.put_record(&r).unwrap();
        let raw = store.records.get(r.id.as_str().as_bytes()).unwrap().unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("HIV-negative-marker-string"));
    }

    #[test]
    fn swapped_record_blobs_fail_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let a = Record::new("a", json!({}));
        let b = Record::new("b", json!({}));
        store.put_record(&a).unwrap();
        store.put_record(&b).unwrap();
        let blob_b = store.records.get(b.id.as_str().as_bytes()).unwrap().unwrap();
        store.records.insert(a.id.as_str().as_bytes(), blob_b).unwrap();
        assert!(matches!(
            store.get_record(&a.id),
            Err(PhaitError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn list_records_filters_orders_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let mut meds = Vec::new();
        for name in ["warfarin", "aspirin", "metformin"] {
            let r = Record::new("medication", json!({"name": name}));
            store.put_record(&r).unwrap();
            meds.push(r.id);
            store.put_record(&Record::new("visit", json!({}))).unwrap();
        }

        let newest: Vec<RecordId> = store
            .list_records(RecordFilter::of_type("medication").newest_first().limit(2))
            .collect::<PhaitResult<_>>()
            .unwrap();
        assert_eq!(newest, vec![meds[2].clone(), meds[1].clone()]);
        assert_eq!(store.list_records(RecordFilter::all()).count(), 6);
    }

    #[test]
    fn identical_attachments_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let a = store.put_attachment(b"x-ray.png bytes").unwrap();
        let b = store.put_attachment(b"x-ray.png bytes").unwrap();
        let c = store.put_attachment(b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let files = fs::read_dir(store.config().attachments_dir()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn closed_store_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let r = Record::new("a", json!({}));
        store.put_record(&r).unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.get_record(&r.id), Err(PhaitError::Locked)));
        assert!(matches!(store.put_attachment(b"x"), Err(PhaitError::Locked)));
    }

    #[test]
    fn subscribers_see_changes_with_increasing_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let mut rx = store.subscribe();
        let mut r = Record::new("a", json!({}));
        store.put_record(&r).unwrap();
        r.fields = json!({"k": 1});
        store.put_record(&r).unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::Created);
        assert_eq!(second.kind, ChangeKind::Updated);
        assert!(second.epoch > first.epoch);
    }
}
