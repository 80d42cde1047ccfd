use std::path::PathBuf;

use thiserror::Error;

/// Conditions that abort a run and are named in its report.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("run lock {path} is held by run {holder} (acquired {acquired_at})")]
    LockHeld {
        path: PathBuf,
        holder: String,
        acquired_at: String,
    },

    #[error("merge left {groups} duplicate key group(s) in {table}: {sample_keys:?}")]
    MergeIntegrity {
        table: String,
        groups: usize,
        sample_keys: Vec<String>,
    },

    #[error("index holds {actual} vectors but production has {expected} embedding rows")]
    IndexCardinalityMismatch { expected: usize, actual: usize },

    #[error("{count} similarity edge(s) reference videos absent from production after {stage}")]
    DanglingSimilarity { stage: String, count: usize },

    #[error("injected failure at {point}")]
    InjectedFailure { point: String },

    #[error("run interrupted before {stage}")]
    Interrupted { stage: String },
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LockHeld { .. } => "LockHeld",
            Self::MergeIntegrity { .. } => "MergeIntegrityError",
            Self::IndexCardinalityMismatch { .. } => "IndexCardinalityMismatch",
            Self::DanglingSimilarity { .. } => "DanglingSimilarity",
            Self::InjectedFailure { .. } => "InjectedFailure",
            Self::Interrupted { .. } => "Interrupted",
        }
    }
}

/// Report label for any error travelling through `anyhow`.
pub fn error_kind(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<PipelineError>()
        .map(PipelineError::kind)
        .unwrap_or("StageError")
}
