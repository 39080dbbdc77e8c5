//! Error taxonomy for the lifecycle engine.
//!
//! Every failure surfaces as a typed [`LifecycleError`] to the immediate caller.
//! `kind()` groups variants into the families callers branch on (404-style lookups,
//! API misuse, transient IO, terminal training failures, bad input).

use thiserror::Error;

use crate::registry::Stage;
use crate::training::tracker::RunId;

/// Coarse family used by callers to decide between fallback, 4xx and backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    StateConflict,
    IoFailure,
    TrainingFailed,
    InvalidInput,
    Internal,
}

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("model version {name}@{version} not found")]
    VersionNotFound { name: String, version: u32 },
    #[error("no version of '{name}' matches {query}")]
    NoMatchingVersion { name: String, query: String },
    #[error("model '{name}' cannot be served: {reason}")]
    ModelNotFound { name: String, reason: String },
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("no model kind '{0}' in catalog")]
    UnknownModelKind(String),

    #[error("query for '{name}' gives both version and stage")]
    AmbiguousQuery { name: String },
    #[error("run {0} is still active")]
    RunAlreadyActive(RunId),
    #[error("run {0} has already ended")]
    RunAlreadyEnded(RunId),
    #[error("artifact {artifact_location} already registered as {name}@{existing_version} ({stage})")]
    DuplicateArtifact { name: String, artifact_location: String, existing_version: u32, stage: Stage },
    #[error("{name}@{version} was trained with preprocessor '{expected}', catalog provides '{actual}'")]
    PreprocessorMismatch { name: String, version: u32, expected: String, actual: String },

    #[error("loading {name}@{version} from {location} failed: {reason}")]
    ModelLoad { name: String, version: u32, location: String, reason: String },
    #[error("artifact at {location} has sha256 {actual}, registry recorded {expected}")]
    ChecksumMismatch { location: String, expected: String, actual: String },
    #[error("artifact io at {location}: {reason}")]
    ArtifactIo { location: String, reason: String },
    #[error("record store: {0}")]
    Storage(String),

    #[error("training run {run_id} failed at epoch {epoch}: {reason}")]
    TrainingFailed { run_id: RunId, epoch: u32, reason: String },
    #[error("training run {run_id} cancelled after epoch {epoch}")]
    TrainingCancelled { run_id: RunId, epoch: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("prediction with {name}@{version} failed: {reason}")]
    Prediction { name: String, version: u32, reason: String },
    #[error("batch item {index} failed: {source}")]
    BatchItemFailed { index: usize, source: Box<LifecycleError> },
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl LifecycleError {
    pub fn kind(&self) -> ErrorKind {
        use LifecycleError::*;
        match self {
            VersionNotFound { .. } | NoMatchingVersion { .. } | ModelNotFound { .. } | RunNotFound(_) | UnknownModelKind(_) => ErrorKind::NotFound,
            AmbiguousQuery { .. } | RunAlreadyActive(_) | RunAlreadyEnded(_) | DuplicateArtifact { .. } | PreprocessorMismatch { .. } | ChecksumMismatch { .. } => {
                ErrorKind::StateConflict
            }
            ModelLoad { .. } | ArtifactIo { .. } | Storage(_) => ErrorKind::IoFailure,
            TrainingFailed { .. } | TrainingCancelled { .. } => ErrorKind::TrainingFailed,
            InvalidInput(_) | InvalidConfig(_) => ErrorKind::InvalidInput,
            Prediction { .. } => ErrorKind::Internal,
            BatchItemFailed { source, .. } => source.kind(),
        }
    }

    /// Only IO failures may be transient; the engine itself never retries them.
    pub fn is_retriable(&self) -> bool { self.kind() == ErrorKind::IoFailure }

    pub fn invalid_input(msg: impl Into<String>) -> Self { Self::InvalidInput(msg.into()) }

    pub fn invalid_config(msg: impl Into<String>) -> Self { Self::InvalidConfig(msg.into()) }

    pub(crate) fn artifact_io(location: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ArtifactIo { location: location.into(), reason: err.to_string() }
    }
}
