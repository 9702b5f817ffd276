use std::path::PathBuf;

use hyper::StatusCode;
use thiserror::Error;

use crate::stages::StageKind;
use crate::timestamp::Timestamp;

/// Failure raised by a single stage. The orchestrator never inspects the variant,
/// it only wraps it into [`PipelineError::Stage`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} stage received unexpected input: expected {expected}")]
    UnexpectedInput {
        stage: StageKind,
        expected: &'static str,
    },
    #[error("{0}")]
    Precondition(String),
    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

impl StageError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is missing the {0} stage")]
    MissingStage(StageKind),
    #[error("{stage} stage failed in run {timestamp}: {source}")]
    Stage {
        stage: StageKind,
        timestamp: Timestamp,
        #[source]
        source: StageError,
    },
    #[error("artifact store error: {0:#}")]
    Store(anyhow::Error),
}

impl PipelineError {
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no servable model found under {}", root.display())]
    NotFound { root: PathBuf },
}

/// Caller-facing failure categories of the prediction path.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Model is not available")]
    ModelNotAvailable,
    #[error("{0}")]
    BadInput(String),
    #[error("{0:#}")]
    Internal(anyhow::Error),
}

impl ServeError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::BadInput(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ModelNotAvailable => StatusCode::NOT_FOUND,
            Self::BadInput(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ResolveError> for ServeError {
    fn from(_: ResolveError) -> Self {
        Self::ModelNotAvailable
    }
}
