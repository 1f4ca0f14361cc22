//! Integration tests: SOS summary orchestration under time budgets.
//!
//! Uses a scripted model that counts invocations, can be slowed down, and can be told to
//! fail, so concurrency, deadline and fallback behavior are observable.

use phait_core::{
    InferenceGateway, InferenceModel, PhaitConfig, PhaitError, Record, RecordFilter,
    ResponseOrigin, RunContext, SosOrchestrator, SosState, VaultStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Default)]
struct ScriptedModel {
    calls: AtomicUsize,
    delay_ms: AtomicU64,
    fail: AtomicBool,
    response: Option<String>,
}

impl ScriptedModel {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_delay(&self, d: Duration) {
        self.delay_ms.store(d.as_millis() as u64, Ordering::SeqCst);
    }

    fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl InferenceModel for ScriptedModel {
    fn run(&self, prompt: &str, ctx: &RunContext) -> Result<String, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let until = Instant::now() + Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        while Instant::now() < until {
            if ctx.is_cancelled() {
                return Err("cancelled".into());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err("engine crashed".into());
        }
        if let Some(r) = &self.response {
            return Ok(r.clone());
        }
        let bullets = prompt
            .split("---")
            .nth(1)
            .unwrap_or("")
            .lines()
            .filter(|l| l.starts_with("- "))
            .count();
        Ok(format!("summary #{} over {} records", n, bullets))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<VaultStore>,
    model: Arc<ScriptedModel>,
    gateway: Arc<InferenceGateway>,
    sos: Arc<SosOrchestrator>,
}

fn harness_with(model: ScriptedModel, tune: impl FnOnce(&mut PhaitConfig)) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = PhaitConfig::with_base_dir(dir.path());
    cfg.key_derivation_iterations = 1_000;
    tune(&mut cfg);
    let store = Arc::new(VaultStore::open(cfg.clone(), "x").unwrap());
    let model = Arc::new(model);
    let gateway = Arc::new(InferenceGateway::new(
        Arc::clone(&model) as Arc<dyn InferenceModel>,
        &cfg,
    ));
    let sos = SosOrchestrator::new(Arc::clone(&store), Arc::clone(&gateway));
    Harness {
        _dir: dir,
        store,
        model,
        gateway,
        sos,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedModel::default(), |_| {})
}

fn seed(store: &VaultStore) -> Record {
    let allergy = Record::new("allergy", json!({"substance": "penicillin"}));
    store.put_record(&allergy).unwrap();
    store
        .put_record(&Record::new("condition", json!({"name": "type 1 diabetes"})))
        .unwrap();
    allergy
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_generates_share_one_model_call() {
    let h = harness();
    seed(&h.store);
    h.model.set_delay(Duration::from_millis(300));

    let a = {
        let sos = Arc::clone(&h.sos);
        tokio::spawn(async move { sos.generate("en").await })
    };
    let b = {
        let sos = Arc::clone(&h.sos);
        tokio::spawn(async move { sos.generate("en").await })
    };
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert_eq!(h.model.calls(), 1);
    assert_eq!(a.artifact, b.artifact);
    assert_eq!(a.origin, ResponseOrigin::Generated);

    // A third call is a cache hit.
    let c = h.sos.generate("en").await.unwrap();
    assert_eq!(c.origin, ResponseOrigin::Cached);
    assert_eq!(h.model.calls(), 1);
    assert_eq!(h.sos.state("en"), SosState::Ready);
}

#[tokio::test(flavor = "multi_thread")]
async fn languages_are_independent() {
    let h = harness();
    seed(&h.store);
    h.sos.generate("en").await.unwrap();
    h.sos.generate("es").await.unwrap();
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.sos.cached("es").unwrap().language, "es");
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_model_times_out_within_the_generation_budget() {
    let h = harness_with(ScriptedModel::default(), |cfg| {
        cfg.sos_generation_timeout_seconds = 0.2;
    });
    seed(&h.store);
    h.model.set_delay(Duration::from_secs(5));

    let started = Instant::now();
    let err = h.sos.generate("en").await.unwrap_err();
    let waited = started.elapsed();

    assert!(
        matches!(err, PhaitError::Timeout { operation: "sos generation", .. }),
        "got {:?}",
        err
    );
    assert!(waited < Duration::from_secs(2), "waited {:?}", waited);
    assert_eq!(h.sos.state("en"), SosState::Failed);
    assert!(h.sos.cached("en").is_none());
    assert_eq!(h.gateway.invocations(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn modified_record_keeps_artifact_stale_until_regenerated() {
    let h = harness();
    let mut allergy = seed(&h.store);
    let first = h.sos.generate("en").await.unwrap();
    assert!(!first.artifact.is_stale);
    assert_eq!(first.artifact.source_record_ids.len(), 2);

    allergy.fields = json!({"substance": "penicillin", "reaction": "anaphylaxis"});
    h.store.put_record(&allergy).unwrap();
    assert!(h.sos.cached("en").unwrap().is_stale);
    assert_eq!(h.sos.state("en"), SosState::Stale);

    // A failing regeneration serves the old artifact as a stale fallback.
    h.model.set_fail(true);
    let fallback = h.sos.regenerate("en", false).await.unwrap();
    assert!(fallback.is_fallback());
    assert!(fallback.artifact.is_stale);
    assert!(matches!(fallback.error, Some(PhaitError::ModelError(_))));
    assert_eq!(fallback.artifact.summary_text, first.artifact.summary_text);
    assert!(h.sos.cached("en").unwrap().is_stale);

    // Still stale: generate goes back to the model rather than the cache.
    h.model.set_fail(false);
    let regenerated = h.sos.generate("en").await.unwrap();
    assert_eq!(regenerated.origin, ResponseOrigin::Generated);
    assert!(!regenerated.artifact.is_stale);
    assert_ne!(regenerated.artifact.summary_text, first.artifact.summary_text);
    assert!(!h.sos.cached("en").unwrap().is_stale);
}

#[tokio::test(flavor = "multi_thread")]
async fn new_record_marks_artifact_stale() {
    let h = harness();
    seed(&h.store);
    h.sos.generate("en").await.unwrap();
    h.store
        .put_record(&Record::new("implant", json!({"device": "pacemaker"})))
        .unwrap();
    assert!(h.sos.cached("en").unwrap().is_stale);

    let regenerated = h.sos.regenerate("en", false).await.unwrap();
    assert_eq!(regenerated.artifact.source_record_ids.len(), 3);
    assert!(regenerated.summary().contains("3 records"));
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_artifact_is_not_regenerated_unless_forced() {
    let h = harness();
    seed(&h.store);
    h.sos.generate("en").await.unwrap();

    let cached = h.sos.regenerate("en", false).await.unwrap();
    assert_eq!(cached.origin, ResponseOrigin::Cached);
    assert_eq!(h.model.calls(), 1);

    let forced = h.sos.regenerate("en", true).await.unwrap();
    assert_eq!(forced.origin, ResponseOrigin::Generated);
    assert_eq!(h.model.calls(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn regeneration_timeout_keeps_previous_artifact_readable() {
    let h = harness_with(ScriptedModel::default(), |cfg| {
        cfg.sos_regeneration_timeout_seconds = 0.2;
    });
    seed(&h.store);
    let first = h.sos.generate("en").await.unwrap();

    h.model.set_delay(Duration::from_secs(5));
    let err = h.sos.regenerate("en", true).await.unwrap_err();
    assert!(matches!(err, PhaitError::Timeout { operation: "sos regeneration", .. }));

    let kept = h.sos.cached("en").unwrap();
    assert_eq!(kept.summary_text, first.artifact.summary_text);
    assert!(kept.is_stale);
    assert_eq!(h.sos.state("en"), SosState::Stale);
}

#[tokio::test(flavor = "multi_thread")]
async fn model_error_without_cache_is_surfaced() {
    let h = harness();
    seed(&h.store);
    h.model.set_fail(true);
    assert!(matches!(
        h.sos.generate("en").await,
        Err(PhaitError::ModelError(_))
    ));
    assert_eq!(h.sos.state("en"), SosState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn search_matches_terms_within_budget() {
    let h = harness();
    seed(&h.store);
    let hits = h.sos.search("PENICILLIN", RecordFilter::all()).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record_type, "allergy");

    let typed = h
        .sos
        .search("", RecordFilter::of_type("condition"))
        .await
        .unwrap();
    assert_eq!(typed.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_search_budget_times_out() {
    let h = harness_with(ScriptedModel::default(), |cfg| {
        cfg.search_timeout_seconds = 1e-9;
    });
    seed(&h.store);
    assert!(matches!(
        h.sos.search("penicillin", RecordFilter::all()).await,
        Err(PhaitError::Timeout { operation: "search", .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn export_writes_a_named_backup() {
    let h = harness();
    seed(&h.store);
    let manifest = h.sos.export("before-trip").await.unwrap();
    assert_eq!(manifest.record_ids.len(), 2);
    assert!(h.store.config().backup_path("before-trip").is_file());
}

#[tokio::test(flavor = "multi_thread")]
async fn interaction_check_needs_two_medications() {
    let model = ScriptedModel {
        response: Some("warfarin | aspirin | major | Increased bleeding risk.".into()),
        ..ScriptedModel::default()
    };
    let h = harness_with(model, |_| {});
    h.store
        .put_record(&Record::new("medication", json!({"name": "warfarin", "dose": "5mg"})))
        .unwrap();
    assert!(h.sos.check_interactions().await.unwrap().is_empty());
    assert_eq!(h.model.calls(), 0);

    h.store
        .put_record(&Record::new("medication", json!({"name": "aspirin", "dose": "81mg"})))
        .unwrap();
    let flags = h.sos.check_interactions().await.unwrap();
    assert_eq!(h.model.calls(), 1);
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0].first, "warfarin");
    assert_eq!(flags[0].second, "aspirin");
}
