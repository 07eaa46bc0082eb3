//! Stage failure kinds.
//!
//! Each pipeline stage reports its failure as one of these kinds. None of them
//! is fatal to the orchestrator loop; the kind decides what gets logged and
//! which counter moves.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Frame source unavailable for this tick.
    #[error("capture failed: {0}")]
    Capture(String),
    /// Classifier errored or timed out. Distinct from an empty detection list.
    #[error("classification failed: {0}")]
    Classification(String),
    /// Image or metadata write failed; this tick's evidence is lost.
    #[error("persisting evidence failed: {0}")]
    Persistence(String),
    /// A single entry could not be removed during a capacity pass.
    #[error("evicting {id} failed: {reason}")]
    Eviction { id: String, reason: String },
    /// An external update supplied an out-of-range value.
    #[error("config rejected: {0}")]
    ConfigRejected(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Capture(_) => "capture",
            PipelineError::Classification(_) => "classification",
            PipelineError::Persistence(_) => "persistence",
            PipelineError::Eviction { .. } => "eviction",
            PipelineError::ConfigRejected(_) => "config",
        }
    }

    pub(crate) fn capture(err: impl std::fmt::Display) -> Self {
        PipelineError::Capture(format!("{:#}", err))
    }

    pub(crate) fn classification(err: impl std::fmt::Display) -> Self {
        PipelineError::Classification(format!("{:#}", err))
    }

    pub(crate) fn persistence(err: impl std::fmt::Display) -> Self {
        PipelineError::Persistence(format!("{:#}", err))
    }
}
