//! The opaque local model behind a narrow, blocking capability.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline and cancellation handed to one model run. Long-running engines should poll
/// [`RunContext::should_stop`] between tokens and bail out early.
#[derive(Debug, Clone)]
pub struct RunContext {
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
}

impl RunContext {
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Cancelled, or out of time.
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// Single blocking `run(prompt) -> text` primitive. Errors are plain engine messages; the
/// gateway turns them into `ModelError`.
pub trait InferenceModel: Send + Sync {
    fn run(&self, prompt: &str, ctx: &RunContext) -> Result<String, String>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "model"
    }
}

/// Deterministic stand-in used until a local engine is wired in. Echoes the bullet lines of
/// the prompt's `---` data block as a summary, or a fixed response.
#[derive(Debug, Default)]
pub struct PlaceholderModel {
    /// If set, return this instead of the echoed bullets.
    pub response: Option<String>,
}

impl PlaceholderModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl InferenceModel for PlaceholderModel {
    fn run(&self, prompt: &str, _ctx: &RunContext) -> Result<String, String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let data = prompt.split("---").nth(1).unwrap_or(prompt);
        let bullets: Vec<&str> = data
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("- "))
            .collect();
        if bullets.is_empty() {
            return Ok("[placeholder model: no records supplied]".to_string());
        }
        Ok(format!(
            "[placeholder model summary]\n{}",
            bullets.join("\n")
        ))
    }

    fn name(&self) -> &str {
        "placeholder"
    }
}
