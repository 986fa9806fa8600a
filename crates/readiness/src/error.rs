use std::time::Duration;
use thiserror::Error;

/// Boxed cause carried by readiness errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcomes of waiting for a dependency.
///
/// `ConnectionFailed` is transient: the gate logs it and retries. Only
/// `DeadlineExceeded` and `Cancelled` are returned to the caller.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// One connection attempt failed
    #[error("connection attempt {attempt} failed: {source}")]
    ConnectionFailed {
        attempt: u32,
        #[source]
        source: BoxError,
    },

    /// The dependency did not become ready before the deadline
    #[error("not ready after {attempts} attempts in {elapsed:?}: {cause}")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        #[source]
        cause: BoxError,
    },

    /// The caller cancelled the wait
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        last_error: Option<BoxError>,
    },
}

impl ReadinessError {
    /// Number of connection attempts made before this outcome.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ConnectionFailed { attempt, .. } => *attempt,
            Self::DeadlineExceeded { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
