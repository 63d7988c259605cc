//! Error taxonomy for the orchestration engine
//!
//! Every stage returns `EvolveError`. Callers in the generation loop decide
//! whether a variant is fatal for the lineage (missing base artifact, lease
//! held) or is logged and skipped (malformed summaries, partial spawns).

use std::path::PathBuf;

use crate::runtime::RuntimeError;

pub type Result<T> = std::result::Result<T, EvolveError>;

#[derive(Debug, thiserror::Error)]
pub enum EvolveError {
    /// The base artifact for a generation is absent or unparsable.
    /// Requires operator intervention before the lineage can resume.
    #[error("missing base artifact for {lineage} gen {generation} at {}: {reason}", path.display())]
    MissingBaseArtifact {
        lineage: String,
        generation: u32,
        path: PathBuf,
        reason: String,
    },

    #[error("remote unavailable at {address}: {reason}")]
    RemoteUnavailable { address: String, reason: String },

    #[error("malformed artifact or summary {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("{failed} of {attempted} units failed to spawn for {lineage} gen {generation} variant {variant}")]
    PartialSpawnFailure {
        lineage: String,
        generation: u32,
        variant: usize,
        attempted: usize,
        failed: usize,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{lineage} gen {generation} is incomplete: {missing} of {expected} variant summaries missing")]
    IncompleteGeneration {
        lineage: String,
        generation: u32,
        missing: usize,
        expected: usize,
    },

    #[error("lease on {lineage} held by {owner} since {since}")]
    LeaseHeld {
        lineage: String,
        owner: String,
        since: String,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<RuntimeError> for EvolveError {
    fn from(err: RuntimeError) -> Self {
        EvolveError::RemoteUnavailable {
            address: err.address().to_string(),
            reason: err.to_string(),
        }
    }
}

impl EvolveError {
    /// Whether a restart can be expected to make progress without manual repair
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EvolveError::RemoteUnavailable { .. }
                | EvolveError::PartialSpawnFailure { .. }
                | EvolveError::WriteFailure { .. }
                | EvolveError::IncompleteGeneration { .. }
                | EvolveError::LeaseHeld { .. }
        )
    }
}
