//! Error types for the document server.
//!
//! Errors are split by where they are handled:
//!
//! - **`RunError`**: document-ordering and run-bookkeeping failures raised by the
//!   run tracker. They are per-document and become `Error` documents.
//! - **`StageError`**: a numeric stage refused or failed an event. Per-event.
//! - **`TransformError`**: what the pipeline reports for one event, either a
//!   payload that could not be read or a stage failure tagged with its stage.
//! - **`RelayError`**: transport failures. Fatal to the server loop.
//! - **`DocumentError`**: encoding/decoding of the JSON wire format.
//! - **`ConfigError`**: loading and validating configuration.
//! - **`ServerError`**: lifecycle errors surfaced to the operator.
//!
//! Per-event errors expose a stable `cause()` string (`UnknownRunError`,
//! `CalibrationError`, ...) and a taxonomy `category()` which are written into
//! outbound `Error` documents.

use crate::data::DocumentKind;
use crate::stage::StageId;
use thiserror::Error;
use uuid::Uuid;

/// Run bookkeeping and ordering failures.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("run {0} already has a live context")]
    DuplicateRun(Uuid),

    #[error("no run context for run {0}")]
    UnknownRun(Uuid),

    #[error("run {0} has already been stopped")]
    ClosedRun(Uuid),

    #[error("{kind} for run {run_id} arrived out of order: {reason}")]
    OutOfOrder {
        run_id: Uuid,
        kind: DocumentKind,
        reason: &'static str,
    },

    #[error("invalid {kind} payload for run {run_id}: {source}")]
    InvalidPayload {
        run_id: Uuid,
        kind: DocumentKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid run settings for run {run_id}: {reason}")]
    InvalidSettings { run_id: Uuid, reason: String },

    #[error("malformed document for run {run_id}: {reason}")]
    MalformedEnvelope { run_id: Uuid, reason: String },
}

impl RunError {
    /// Stable cause name written into `Error` documents.
    pub fn cause(&self) -> &'static str {
        match self {
            RunError::DuplicateRun(_) => "DuplicateRunError",
            RunError::UnknownRun(_) => "UnknownRunError",
            RunError::ClosedRun(_) => "ClosedRunError",
            RunError::OutOfOrder { .. }
            | RunError::InvalidPayload { .. }
            | RunError::InvalidSettings { .. }
            | RunError::MalformedEnvelope { .. } => "ProtocolError",
        }
    }

    /// Taxonomy bucket.
    pub fn category(&self) -> &'static str {
        match self {
            RunError::DuplicateRun(_) => "DuplicateRunError",
            _ => "ProtocolError",
        }
    }
}

/// Failure of a single numeric stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("transform precondition not met: {0}")]
    Precondition(String),
}

impl StageError {
    pub fn cause(&self) -> &'static str {
        match self {
            StageError::Calibration(_) => "CalibrationError",
            StageError::Precondition(_) => "TransformPreconditionError",
        }
    }
}

/// Failure of one event's transform.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("unreadable event payload: {0}")]
    Payload(String),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: StageId,
        #[source]
        source: StageError,
    },

    #[error("transform worker dropped the event: {0}")]
    Worker(String),

    #[error("transform abandoned when the server stopped")]
    Abandoned,
}

impl TransformError {
    pub fn cause(&self) -> &'static str {
        match self {
            TransformError::Payload(_) => "ProtocolError",
            TransformError::Stage { source, .. } => source.cause(),
            TransformError::Worker(_) | TransformError::Abandoned => "WorkerError",
        }
    }

    pub fn category(&self) -> &'static str {
        self.cause()
    }

    /// The failing stage, if a stage was running.
    pub fn stage(&self) -> Option<StageId> {
        match self {
            TransformError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Transport-level relay failures.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay connection to {0} closed")]
    Closed(String),
}

/// JSON wire format failures.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("failed to decode document: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("configuration validation error: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Server lifecycle failures.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("relay connection error: {0}")]
    Relay(#[from] RelayError),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("failed to build transform worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Convenience alias for server results.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_error_causes() {
        let id = Uuid::new_v4();
        assert_eq!(RunError::UnknownRun(id).cause(), "UnknownRunError");
        assert_eq!(RunError::ClosedRun(id).cause(), "ClosedRunError");
        assert_eq!(RunError::DuplicateRun(id).category(), "DuplicateRunError");
        assert_eq!(RunError::ClosedRun(id).category(), "ProtocolError");
    }

    #[test]
    fn test_transform_error_stage() {
        let err = TransformError::Stage {
            stage: StageId::Calibration,
            source: StageError::Calibration("missing wavelength".into()),
        };
        assert_eq!(err.cause(), "CalibrationError");
        assert_eq!(err.stage(), Some(StageId::Calibration));
        assert!(err.to_string().contains("missing wavelength"));
    }

    #[test]
    fn test_worker_failures_share_a_cause() {
        let dropped = TransformError::Worker("pool shut down".into());
        assert_eq!(dropped.cause(), "WorkerError");
        assert_eq!(dropped.category(), "WorkerError");
        assert_eq!(dropped.stage(), None);
        assert_eq!(TransformError::Abandoned.cause(), "WorkerError");
        assert_eq!(TransformError::Abandoned.category(), "WorkerError");
    }
}
