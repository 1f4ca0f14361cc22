//! **SosOrchestrator**: Builds and caches per-language SOS summaries under time budgets.
//!
//! Pipeline per language: `Idle → Fetching → Summarizing → Ready`, failing to `Stale`
//! (a previous artifact is still cached) or `Failed` (nothing cached).
//!
//! - Fetch and inference share one deadline: the model gets whatever the fetch left over.
//! - At most one pipeline per language runs at a time. Callers arriving while it runs
//!   attach to its outcome through a `watch` channel instead of invoking the model again.
//! - Staleness is decided by the vault's write epoch. An artifact records the epoch seen
//!   before its records were read; any later write marks it stale, and only a successful
//!   regeneration replaces it.
//! - A `ModelError` with an artifact cached hands back that artifact as a fallback, marked
//!   stale. Timeouts are always surfaced; the previous artifact stays readable via `cached`.
//!
//! Search, export and the medication interaction check run under their own budgets.

mod bounded;
mod interactions;
mod state;

pub use interactions::{InteractionFlag, InteractionSeverity};
pub use state::{ResponseOrigin, SosArtifact, SosResponse, SosState};

use crate::backup::{BackupManager, BackupManifest};
use crate::config::{Operation, PhaitConfig};
use crate::error::{PhaitError, PhaitResult};
use crate::inference::InferenceGateway;
use crate::prompts::{interactions_prompt, language_name, sos_summary_prompt};
use crate::vault::{Record, RecordFilter, VaultStore, MEDICATION_RECORD_TYPE};
use bounded::{bounded_blocking, fetch_records, search_records};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

type Outcome = Option<PhaitResult<SosResponse>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Generate,
    Regenerate,
}

impl Mode {
    fn operation(self) -> Operation {
        match self {
            Self::Generate => Operation::SosGeneration,
            Self::Regenerate => Operation::SosRegeneration,
        }
    }
}

struct LanguageSlot {
    state: SosState,
    artifact: Option<SosArtifact>,
    /// Vault epoch observed before the artifact's records were read.
    artifact_epoch: u64,
    in_flight: Option<watch::Receiver<Outcome>>,
}

impl LanguageSlot {
    fn new() -> Self {
        Self {
            state: SosState::Idle,
            artifact: None,
            artifact_epoch: 0,
            in_flight: None,
        }
    }

    fn mark_stale(&mut self) {
        if let Some(artifact) = self.artifact.as_mut() {
            artifact.is_stale = true;
            if self.in_flight.is_none() {
                self.state = SosState::Stale;
            }
        }
    }

    /// Mark the artifact stale if the vault has been written since it was built.
    fn refresh(&mut self, vault_epoch: u64) {
        let outdated = self
            .artifact
            .as_ref()
            .is_some_and(|a| !a.is_stale && vault_epoch > self.artifact_epoch);
        if outdated {
            self.mark_stale();
        }
    }

    fn fresh(&self) -> Option<&SosArtifact> {
        self.artifact.as_ref().filter(|a| !a.is_stale)
    }

    /// The running pipeline, unless its task died without reporting.
    fn attachable(&self) -> Option<watch::Receiver<Outcome>> {
        self.in_flight
            .as_ref()
            .filter(|rx| rx.has_changed().is_ok())
            .cloned()
    }
}

pub struct SosOrchestrator {
    store: Arc<VaultStore>,
    backups: BackupManager,
    gateway: Arc<InferenceGateway>,
    slots: Mutex<HashMap<String, LanguageSlot>>,
}

impl SosOrchestrator {
    pub fn new(store: Arc<VaultStore>, gateway: Arc<InferenceGateway>) -> Arc<Self> {
        Arc::new(Self {
            backups: BackupManager::new(Arc::clone(&store)),
            store,
            gateway,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn config(&self) -> &PhaitConfig {
        self.store.config()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, LanguageSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_language(&self, language: &str) -> PhaitResult<()> {
        if self.config().supports_language(language) {
            Ok(())
        } else {
            Err(PhaitError::UnsupportedLanguage(language.to_string()))
        }
    }

    // ---------------------------------------------------------------------
    // SOS summaries
    // ---------------------------------------------------------------------

    /// Fresh cached artifact if there is one; otherwise build (or rebuild a stale one).
    pub async fn generate(self: &Arc<Self>, language: &str) -> PhaitResult<SosResponse> {
        self.check_language(language)?;
        let rx = {
            let epoch = self.store.epoch();
            let mut slots = self.slots();
            let slot = slots
                .entry(language.to_string())
                .or_insert_with(LanguageSlot::new);
            slot.refresh(epoch);
            if let Some(rx) = slot.attachable() {
                tracing::debug!(target: "phait::sos", language, "attaching to in-flight SOS pipeline");
                rx
            } else if let Some(artifact) = slot.fresh() {
                return Ok(SosResponse::cached(artifact.clone()));
            } else {
                let mode = if slot.artifact.is_some() {
                    Mode::Regenerate
                } else {
                    Mode::Generate
                };
                self.start_pipeline(slot, language, mode)
            }
        };
        await_outcome(rx).await
    }

    /// Rebuild when the artifact is stale or `force` is set; otherwise return the cached
    /// artifact. With nothing cached and no `force`, there is nothing to regenerate.
    pub async fn regenerate(
        self: &Arc<Self>,
        language: &str,
        force: bool,
    ) -> PhaitResult<SosResponse> {
        self.check_language(language)?;
        let rx = {
            let epoch = self.store.epoch();
            let mut slots = self.slots();
            let slot = slots
                .entry(language.to_string())
                .or_insert_with(LanguageSlot::new);
            slot.refresh(epoch);
            let stale = slot.artifact.as_ref().is_some_and(|a| a.is_stale);
            if let Some(rx) = slot.attachable() {
                rx
            } else if force || stale {
                self.start_pipeline(slot, language, Mode::Regenerate)
            } else if let Some(artifact) = slot.fresh() {
                return Ok(SosResponse::cached(artifact.clone()));
            } else {
                return Err(PhaitError::not_found("sos artifact", language));
            }
        };
        await_outcome(rx).await
    }

    fn start_pipeline(
        self: &Arc<Self>,
        slot: &mut LanguageSlot,
        language: &str,
        mode: Mode,
    ) -> watch::Receiver<Outcome> {
        let (tx, rx) = watch::channel(None);
        slot.in_flight = Some(rx.clone());
        slot.state = SosState::Fetching;
        tracing::info!(target: "phait::sos", language, ?mode, "🚑 SOS pipeline started");
        tokio::spawn(Arc::clone(self).run_pipeline(language.to_string(), mode, tx));
        rx
    }

    async fn run_pipeline(self: Arc<Self>, language: String, mode: Mode, tx: watch::Sender<Outcome>) {
        let started = Instant::now();
        let outcome = self.build_artifact(&language, mode).await;
        let response = self.finish(&language, outcome);
        match &response {
            Ok(r) => tracing::info!(
                target: "phait::sos",
                language = %language,
                origin = ?r.origin,
                records = r.artifact.source_record_ids.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "SOS pipeline finished"
            ),
            Err(e) => tracing::warn!(
                target: "phait::sos",
                language = %language,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "SOS pipeline failed"
            ),
        }
        // Every attached caller may already be gone.
        let _ = tx.send(Some(response));
    }

    /// Returns the artifact and the vault epoch its records were read at.
    async fn build_artifact(&self, language: &str, mode: Mode) -> PhaitResult<(SosArtifact, u64)> {
        let op = mode.operation();
        let label = op.label();
        let budget = self.config().budget(op);
        let deadline = Instant::now() + budget;

        let epoch = self.store.epoch();
        let store = Arc::clone(&self.store);
        let records = bounded_blocking(label, budget, deadline, move |cancel| {
            fetch_records(&store, RecordFilter::all(), cancel, label, budget)
        })
        .await?;

        self.set_state(language, SosState::Summarizing);
        let source_record_ids = records.iter().map(|r| r.id.clone()).collect();
        let prompt = sos_summary_prompt(language_name(language), &render_records(&records));
        drop(records);

        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = self
            .gateway
            .invoke_for(label, &prompt, remaining)
            .await
            .map_err(|e| match e {
                PhaitError::Timeout { .. } => PhaitError::Timeout {
                    operation: label,
                    budget,
                },
                other => other,
            })?;

        let artifact = SosArtifact {
            language: language.to_string(),
            generated_at: Utc::now(),
            summary_text: output.text,
            source_record_ids,
            is_stale: false,
        };
        Ok((artifact, epoch))
    }

    /// Install the outcome and clear the in-flight marker in one critical section.
    fn finish(
        &self,
        language: &str,
        outcome: PhaitResult<(SosArtifact, u64)>,
    ) -> PhaitResult<SosResponse> {
        let vault_epoch = self.store.epoch();
        let mut slots = self.slots();
        let slot = slots
            .entry(language.to_string())
            .or_insert_with(LanguageSlot::new);
        slot.in_flight = None;

        match outcome {
            Ok((mut artifact, epoch)) => {
                // Writes that landed while the pipeline ran are not in this summary.
                artifact.is_stale = vault_epoch > epoch;
                slot.state = if artifact.is_stale {
                    SosState::Stale
                } else {
                    SosState::Ready
                };
                slot.artifact = Some(artifact.clone());
                slot.artifact_epoch = epoch;
                Ok(SosResponse::generated(artifact))
            }
            Err(err) => {
                slot.mark_stale();
                slot.state = if slot.artifact.is_some() {
                    SosState::Stale
                } else {
                    SosState::Failed
                };
                match (&err, &slot.artifact) {
                    (PhaitError::ModelError(_), Some(previous)) => {
                        tracing::warn!(
                            target: "phait::sos",
                            language,
                            "serving last good SOS summary after model error"
                        );
                        Ok(SosResponse::fallback(previous.clone(), err))
                    }
                    _ => Err(err),
                }
            }
        }
    }

    fn set_state(&self, language: &str, state: SosState) {
        if let Some(slot) = self.slots().get_mut(language) {
            slot.state = state;
        }
    }

    /// Last artifact for `language`, fresh or stale.
    pub fn cached(&self, language: &str) -> Option<SosArtifact> {
        let epoch = self.store.epoch();
        let mut slots = self.slots();
        let slot = slots.get_mut(language)?;
        slot.refresh(epoch);
        slot.artifact.clone()
    }

    pub fn state(&self, language: &str) -> SosState {
        let epoch = self.store.epoch();
        let mut slots = self.slots();
        match slots.get_mut(language) {
            Some(slot) => {
                slot.refresh(epoch);
                slot.state
            }
            None => SosState::Idle,
        }
    }

    /// Force the cached artifact stale (e.g. after an out-of-band data change).
    pub fn invalidate(&self, language: &str) {
        if let Some(slot) = self.slots().get_mut(language) {
            slot.mark_stale();
            tracing::debug!(target: "phait::sos", language, "SOS summary invalidated");
        }
    }

    // ---------------------------------------------------------------------
    // Search / export / interaction check
    // ---------------------------------------------------------------------

    /// Records containing every term of `query`, within `search_timeout_seconds`.
    pub async fn search(&self, query: &str, filter: RecordFilter) -> PhaitResult<Vec<Record>> {
        let budget = self.config().budget(Operation::Search);
        let deadline = Instant::now() + budget;
        let store = Arc::clone(&self.store);
        let query = query.to_string();
        let hits = bounded_blocking(Operation::Search.label(), budget, deadline, move |cancel| {
            search_records(&store, &query, filter, cancel, budget)
        })
        .await?;
        tracing::debug!(target: "phait::sos", hits = hits.len(), "search finished");
        Ok(hits)
    }

    /// Write a named backup within `export_timeout_seconds`. A write that outlives the budget
    /// still lands atomically or not at all.
    pub async fn export(&self, name: &str) -> PhaitResult<BackupManifest> {
        let budget = self.config().budget(Operation::Export);
        let deadline = Instant::now() + budget;
        let backups = self.backups.clone();
        let name = name.to_string();
        bounded_blocking(Operation::Export.label(), budget, deadline, move |_| {
            backups.create_named(&name)
        })
        .await
    }

    /// Ask the model for interacting pairs among `medication` records. Fewer than two
    /// medications means nothing to check and no model call.
    pub async fn check_interactions(&self) -> PhaitResult<Vec<InteractionFlag>> {
        let op = Operation::InteractionCheck;
        let label = op.label();
        let budget = self.config().budget(op);
        let deadline = Instant::now() + budget;

        let store = Arc::clone(&self.store);
        let meds = bounded_blocking(label, budget, deadline, move |cancel| {
            fetch_records(
                &store,
                RecordFilter::of_type(MEDICATION_RECORD_TYPE),
                cancel,
                label,
                budget,
            )
        })
        .await?;
        if meds.len() < 2 {
            return Ok(Vec::new());
        }

        let prompt = interactions_prompt(&interactions::render_medications(&meds));
        drop(meds);
        let remaining = deadline.saturating_duration_since(Instant::now());
        let output = self
            .gateway
            .invoke_for(label, &prompt, remaining)
            .await
            .map_err(|e| match e {
                PhaitError::Timeout { .. } => PhaitError::Timeout {
                    operation: label,
                    budget,
                },
                other => other,
            })?;
        let flags = interactions::parse_interactions(&output.text);
        tracing::info!(target: "phait::sos", flags = flags.len(), "💊 interaction check finished");
        Ok(flags)
    }
}

impl std::fmt::Debug for SosOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SosOrchestrator")
            .field("languages", &self.slots().len())
            .finish()
    }
}

async fn await_outcome(mut rx: watch::Receiver<Outcome>) -> PhaitResult<SosResponse> {
    let result = match rx.wait_for(|outcome| outcome.is_some()).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err(PhaitError::ModelError("SOS pipeline produced no outcome".into())),
        },
        Err(_) => Err(PhaitError::ModelError(
            "SOS pipeline ended without an outcome".into(),
        )),
    };
    result
}

/// One `- type: key: value; ...` line per record.
fn render_records(records: &[Record]) -> String {
    if records.is_empty() {
        return "(no records on file)".to_string();
    }
    records
        .iter()
        .map(|r| {
            let body = match &r.fields {
                serde_json::Value::Object(map) => map
                    .iter()
                    .map(|(k, v)| match v {
                        serde_json::Value::String(s) => format!("{}: {}", k, s),
                        other => format!("{}: {}", k, other),
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            format!("- {}: {}", r.record_type, body)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
