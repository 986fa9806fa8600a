//! Error types for the trace pipeline.

use std::time::Duration;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, gRPC)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out after {0:?}")]
    Timeout(Duration),
    /// The exporter has been shut down and no longer accepts batches
    #[error("exporter has been shut down")]
    Shutdown,
}

/// Errors raised while building, flushing or tearing down the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The span exporter could not be constructed (malformed endpoint,
    /// unreachable collector when connecting eagerly).
    #[error("failed to configure span exporter: {0}")]
    ExporterInitFailed(String),

    /// One step of the shutdown sequence failed. Logged, never fatal.
    #[error("shutdown step `{step}` failed: {reason}")]
    ShutdownStepFailed { step: &'static str, reason: String },

    /// Shutdown did not complete within its budget; unexported spans were dropped.
    #[error("shutdown timed out after {timeout:?}, {dropped_spans} spans dropped")]
    ShutdownTimedOut { timeout: Duration, dropped_spans: u64 },

    /// Shutdown was already requested; nothing was done.
    #[error("pipeline already shut down")]
    AlreadyShutdown,

    /// A flush was requested but the export worker is no longer running.
    #[error("export worker is not running")]
    WorkerGone,

    /// A flush did not complete within its budget.
    #[error("flush timed out after {0:?}")]
    FlushTimedOut(Duration),

    /// A batch failed to export during a flush.
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

impl PipelineError {
    /// Returns `true` for outcomes that are harmless to ignore, such as a
    /// repeated shutdown.
    #[inline]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyShutdown)
    }
}
