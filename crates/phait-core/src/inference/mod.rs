//! **InferenceGateway**: One deadline-bounded call into the local model.
//!
//! The model runs on tokio's blocking pool; `tokio::time::timeout` bounds the wait. When the
//! budget runs out the caller gets `Timeout` right away and the run's cancel flag is raised
//! so a cooperative engine can stop. The gateway keeps no per-call state and never retries:
//! the orchestrator owns retry decisions because it knows the operation's budget.

mod model;

pub use model::{InferenceModel, PlaceholderModel, RunContext};

use crate::config::PhaitConfig;
use crate::error::{PhaitError, PhaitResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Model text plus how long the call took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceOutput {
    pub text: String,
    pub elapsed: Duration,
}

pub struct InferenceGateway {
    model: Arc<dyn InferenceModel>,
    model_path: PathBuf,
    invocations: AtomicU64,
}

impl InferenceGateway {
    pub fn new(model: Arc<dyn InferenceModel>, config: &PhaitConfig) -> Self {
        Self {
            model,
            model_path: config.ai_model_path(),
            invocations: AtomicU64::new(0),
        }
    }

    /// Gateway over [`PlaceholderModel`].
    pub fn placeholder(config: &PhaitConfig) -> Self {
        Self::new(Arc::new(PlaceholderModel::new()), config)
    }

    pub fn model_path(&self) -> &PathBuf {
        &self.model_path
    }

    /// Whether the model asset exists under `models/`.
    pub fn model_available(&self) -> bool {
        self.model_path.is_file()
    }

    /// Model runs started through this gateway.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub async fn invoke(&self, prompt: &str, budget: Duration) -> PhaitResult<InferenceOutput> {
        self.invoke_for("inference", prompt, budget).await
    }

    /// Like [`invoke`](Self::invoke), reporting `operation` in a `Timeout`.
    pub async fn invoke_for(
        &self,
        operation: &'static str,
        prompt: &str,
        budget: Duration,
    ) -> PhaitResult<InferenceOutput> {
        if budget.is_zero() {
            return Err(PhaitError::Timeout { operation, budget });
        }
        let started = Instant::now();
        let ctx = RunContext::new(started + budget);
        let run_ctx = ctx.clone();
        let model = Arc::clone(&self.model);
        let prompt_owned = prompt.to_string();

        self.invocations.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            target: "phait::inference",
            model = self.model.name(),
            operation,
            prompt_chars = prompt.len(),
            budget_ms = budget.as_millis() as u64,
            "model call started"
        );

        let result = tokio::time::timeout(
            budget,
            tokio::task::spawn_blocking(move || model.run(&prompt_owned, &run_ctx)),
        )
        .await;
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(Ok(text))) => {
                if text.trim().is_empty() {
                    tracing::warn!(target: "phait::inference", operation, "model returned empty output");
                    return Err(PhaitError::ModelError("model returned empty output".into()));
                }
                tracing::debug!(
                    target: "phait::inference",
                    operation,
                    elapsed_ms = elapsed.as_millis() as u64,
                    output_chars = text.len(),
                    "model call finished"
                );
                Ok(InferenceOutput { text, elapsed })
            }
            Ok(Ok(Err(msg))) => {
                tracing::warn!(target: "phait::inference", operation, error = %msg, "model call failed");
                Err(PhaitError::ModelError(msg))
            }
            Ok(Err(join_err)) => {
                tracing::error!(target: "phait::inference", operation, error = %join_err, "model thread panicked");
                Err(PhaitError::ModelError(format!("model thread panicked: {}", join_err)))
            }
            Err(_) => {
                ctx.cancel();
                tracing::warn!(
                    target: "phait::inference",
                    operation,
                    budget_ms = budget.as_millis() as u64,
                    "⏱️ model call exceeded its budget; cancelled"
                );
                Err(PhaitError::Timeout { operation, budget })
            }
        }
    }
}

impl std::fmt::Debug for InferenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceGateway")
            .field("model", &self.model.name())
            .field("model_path", &self.model_path)
            .field("invocations", &self.invocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy(Duration);

    impl InferenceModel for Sleepy {
        fn run(&self, _prompt: &str, ctx: &RunContext) -> Result<String, String> {
            let until = Instant::now() + self.0;
            while Instant::now() < until {
                if ctx.is_cancelled() {
                    return Err("cancelled".into());
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok("done".into())
        }
    }

    fn gateway(model: impl InferenceModel + 'static) -> InferenceGateway {
        let cfg = PhaitConfig::with_base_dir(std::env::temp_dir().join("phait-gateway-test"));
        InferenceGateway::new(Arc::new(model), &cfg)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn returns_model_text() {
        let gw = gateway(PlaceholderModel::with_response("ok"));
        let out = gw.invoke("hi", Duration::from_secs(2)).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(gw.invocations(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_model_times_out_near_deadline() {
        let gw = gateway(Sleepy(Duration::from_secs(5)));
        let started = Instant::now();
        let err = gw.invoke("hi", Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, PhaitError::Timeout { operation: "inference", .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn empty_output_is_model_error() {
        let gw = gateway(PlaceholderModel::with_response("   "));
        assert!(matches!(
            gw.invoke("hi", Duration::from_secs(1)).await,
            Err(PhaitError::ModelError(_))
        ));
    }

    #[tokio::test]
    async fn zero_budget_never_starts_the_model() {
        let gw = gateway(PlaceholderModel::new());
        assert!(gw.invoke("hi", Duration::ZERO).await.unwrap_err().is_timeout());
        assert_eq!(gw.invocations(), 0);
    }
}
