//! Readiness Gate
//!
//! Holds service startup until a mandatory dependency (the database) accepts a
//! connection, retrying with an injectable [`Backoff`] until a fixed deadline
//! anchored at the first attempt. Transient failures are absorbed and logged;
//! only the terminal outcome reaches the caller:
//!
//! - `Ok(connection)` as soon as an attempt succeeds
//! - [`ReadinessError::DeadlineExceeded`] carrying the last failure
//! - [`ReadinessError::Cancelled`] when the caller's token fires, during a
//!   connection attempt or a sleep
//!
//! Each attempt can be recorded as a `storage.connect` child span of a
//! caller-supplied parent span.

pub mod backoff;
pub mod connector;
pub mod error;
pub mod gate;

pub use backoff::{Backoff, ExponentialBackoff, FixedInterval};
pub use connector::Connector;
pub use error::{BoxError, ReadinessError};
pub use gate::{acquire_ready, ConnectionAttempt, ReadinessConfig, ReadinessGate, ATTEMPT_SPAN_NAME};
pub use tokio_util::sync::CancellationToken;
