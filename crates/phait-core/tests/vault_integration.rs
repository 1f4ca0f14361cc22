//! Integration tests: encrypted vault round-trips, tamper detection and persistence.
//!
//! ## Scenario
//! 1. Open a vault with secret "x" and store attachment bytes `b"report"`.
//! 2. Read them back exactly.
//! 3. Flip one byte of `attachments/<id>.enc` on disk.
//! 4. **Confirm** the read now fails with `AuthenticationFailure`, not garbage plaintext.

use phait_core::{
    AttachmentId, PhaitConfig, PhaitError, Record, RecordFilter, RecordId, VaultStore,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(dir: &Path) -> PhaitConfig {
    let mut cfg = PhaitConfig::with_base_dir(dir);
    cfg.key_derivation_iterations = 1_000;
    cfg
}

#[test]
fn corrupted_attachment_fails_authentication() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let store = VaultStore::open(cfg.clone(), "x").unwrap();

    let id = store.put_attachment(b"report").unwrap();
    assert_eq!(store.get_attachment(&id).unwrap(), b"report");

    let path = cfg.attachment_path(id.as_str());
    let mut sealed = std::fs::read(&path).unwrap();
    assert!(!sealed.windows(6).any(|w| w == b"report"));
    let last = sealed.len() - 1;
    sealed[last] ^= 0x80;
    std::fs::write(&path, &sealed).unwrap();

    let err = store.get_attachment(&id).unwrap_err();
    assert!(
        matches!(err, PhaitError::AuthenticationFailure(_)),
        "expected AuthenticationFailure, got {:?}",
        err
    );
    assert!(!err.is_timeout());
}

#[test]
fn re_adding_content_replaces_a_corrupted_attachment() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let store = VaultStore::open(cfg.clone(), "x").unwrap();

    let id = store.put_attachment(b"report").unwrap();
    let path = cfg.attachment_path(id.as_str());
    let mut sealed = std::fs::read(&path).unwrap();
    let last = sealed.len() - 1;
    sealed[last] ^= 0x01;
    std::fs::write(&path, &sealed).unwrap();
    assert!(store.get_attachment(&id).is_err());

    let again = store.put_attachment(b"report").unwrap();
    assert_eq!(again, id);
    assert_eq!(store.get_attachment(&id).unwrap(), b"report");

    // A healthy file is left alone on the next upload.
    let healthy = std::fs::read(&path).unwrap();
    store.put_attachment(b"report").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), healthy);
}

#[test]
fn every_header_byte_is_authenticated() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let store = VaultStore::open(cfg.clone(), "x").unwrap();
    let id = store.put_attachment(b"lab results").unwrap();
    let path = cfg.attachment_path(id.as_str());
    let pristine = std::fs::read(&path).unwrap();

    for i in 0..pristine.len() {
        let mut tampered = pristine.clone();
        tampered[i] ^= 0x01;
        std::fs::write(&path, &tampered).unwrap();
        assert!(
            store.get_attachment(&id).is_err(),
            "flipping byte {} went undetected",
            i
        );
    }
    std::fs::write(&path, &pristine).unwrap();
    assert_eq!(store.get_attachment(&id).unwrap(), b"lab results");
}

#[test]
fn unknown_and_malformed_attachment_ids_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = VaultStore::open(test_config(dir.path()), "x").unwrap();
    for id in ["00ff00ff00ff00ff00ff00ff00ff00ff", "../data/master.key"] {
        assert!(matches!(
            store.get_attachment(&AttachmentId::from(id)),
            Err(PhaitError::NotFound { kind: "attachment", .. })
        ));
    }
}

#[test]
fn records_survive_reopen_and_reject_wrong_secret() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let record = Record::new("allergy", json!({"substance": "penicillin", "reaction": "anaphylaxis"}));
    {
        let store = VaultStore::open(cfg.clone(), "x").unwrap();
        store.put_record(&record).unwrap();
        store.close().unwrap();
    }

    assert!(matches!(
        VaultStore::open(cfg.clone(), "not-x"),
        Err(PhaitError::InvalidSecret)
    ));

    let store = VaultStore::open(cfg, "x").unwrap();
    let loaded = store.get_record(&record.id).unwrap();
    assert_eq!(loaded, record);
}

#[test]
fn chacha_vault_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.encryption_algorithm = "ChaCha20-Poly1305".into();
    let store = VaultStore::open(cfg, "x").unwrap();
    let r = Record::new("condition", json!({"name": "epilepsy"}));
    store.put_record(&r).unwrap();
    assert_eq!(store.get_record(&r.id).unwrap().fields["name"], "epilepsy");
}

#[test]
fn list_records_is_lazy_and_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let store = VaultStore::open(test_config(dir.path()), "x").unwrap();
    let ids: Vec<RecordId> = (0..5)
        .map(|i| store.put_record(&Record::new("visit", json!({"n": i}))).unwrap())
        .collect();

    let mut iter = store.list_records(RecordFilter::all());
    assert_eq!(iter.next().unwrap().unwrap(), ids[0]);
    assert_eq!(iter.next().unwrap().unwrap(), ids[1]);

    let newest: Vec<RecordId> = store
        .list_records(RecordFilter::all().newest_first())
        .map(Result::unwrap)
        .collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(newest, expected);
}

#[test]
fn readers_never_see_partial_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(VaultStore::open(test_config(dir.path()), "x").unwrap());
    let mut record = Record::new("vitals", json!({"pulse": 0}));
    store.put_record(&record).unwrap();
    let id = record.id.clone();

    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for _ in 0..200 {
                let r = store.get_record(&id).unwrap();
                assert!(r.fields["pulse"].is_number());
            }
        })
    };
    for pulse in 1..200 {
        record.fields = json!({"pulse": pulse});
        store.put_record(&record).unwrap();
    }
    reader.join().unwrap();
    assert_eq!(store.record_count(), 1);
}

#[test]
fn leftover_temp_files_are_swept_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    drop(VaultStore::open(cfg.clone(), "x").unwrap());

    let stray = cfg.attachments_dir().join(".abc.enc.deadbeef.tmp");
    std::fs::write(&stray, b"half-written").unwrap();
    let _store = VaultStore::open(cfg, "x").unwrap();
    assert!(!stray.exists());
}
