//! SOS artifact, per-language pipeline state, and the response handed to callers.

use crate::error::PhaitError;
use crate::vault::RecordId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline state for one language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SosState {
    Idle,
    Fetching,
    Summarizing,
    Ready,
    /// A cached artifact exists but no longer reflects the vault.
    Stale,
    /// The last attempt failed and nothing is cached.
    Failed,
}

impl fmt::Display for SosState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching",
            Self::Summarizing => "summarizing",
            Self::Ready => "ready",
            Self::Stale => "stale",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A generated emergency summary, cached per language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SosArtifact {
    pub language: String,
    pub generated_at: DateTime<Utc>,
    pub summary_text: String,
    pub source_record_ids: Vec<RecordId>,
    /// Once true, only a successful regeneration produces a fresh artifact.
    pub is_stale: bool,
}

/// Where a response's artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOrigin {
    /// Fresh artifact served from cache; no model call.
    Cached,
    /// Built by a pipeline run (this caller's or one it attached to).
    Generated,
    /// The pipeline failed; this is the last good artifact, marked stale.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SosResponse {
    pub artifact: SosArtifact,
    pub origin: ResponseOrigin,
    /// The failure that forced a fallback.
    pub error: Option<PhaitError>,
}

impl SosResponse {
    pub(crate) fn cached(artifact: SosArtifact) -> Self {
        Self {
            artifact,
            origin: ResponseOrigin::Cached,
            error: None,
        }
    }

    pub(crate) fn generated(artifact: SosArtifact) -> Self {
        Self {
            artifact,
            origin: ResponseOrigin::Generated,
            error: None,
        }
    }

    pub(crate) fn fallback(artifact: SosArtifact, error: PhaitError) -> Self {
        Self {
            artifact,
            origin: ResponseOrigin::Fallback,
            error: Some(error),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.origin == ResponseOrigin::Fallback
    }

    pub fn summary(&self) -> &str {
        &self.artifact.summary_text
    }
}
