//! Error types for stage processing
//!
//! Every variant is session-local. The stage registry turns them into
//! diagnostics; none of them ever aborts a batch.

use crate::heatmap::lock::LockError;
use crate::predict::PredictError;
use crate::tools::ToolError;
use thiserror::Error;

/// Stage processing error
#[derive(Debug, Error)]
pub enum StageError {
    /// Required reference modality absent; stage skipped, nothing written
    #[error("Missing modality: {0}")]
    MissingModality(String),

    /// Mask, transform or target expected from an earlier stage not found
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    /// External operation exited non-zero
    #[error("Command `{command}` failed with exit code {exit_code}: {stderr}")]
    ToolFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// External operation could not be launched or joined
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Heatmap ledger lock could not be acquired or released
    #[error("Heatmap lock error: {0}")]
    Lock(#[from] LockError),

    /// Model-backed prediction failed
    #[error("Prediction failed: {0}")]
    Prediction(#[from] PredictError),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// neuroprep-common error
    #[error("Common error: {0}")]
    Common(#[from] neuroprep_common::Error),
}

impl StageError {
    /// Short category name used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::MissingModality(_) => "missing-modality",
            StageError::MissingArtifact(_) => "missing-artifact",
            StageError::ToolFailed { .. } | StageError::Tool(_) => "external-tool",
            StageError::Lock(_) => "aggregation-lock",
            StageError::Prediction(_) => "prediction",
            StageError::Io(_) | StageError::Common(_) => "io",
        }
    }
}
