//! The retry-until-ready loop.
//!
//! ```text
//!   attempt ──ok──▶ return connection
//!      │
//!     err ──▶ log ──▶ elapsed >= max_wait? ──yes──▶ DeadlineExceeded
//!                          │ no
//!                          ▼
//!        sleep min(backoff, remaining) ──▶ deadline reached? ──yes──▶ DeadlineExceeded
//!                          │ no
//!                          └──────────────▶ attempt
//! ```
//!
//! Cancellation and the deadline are both observed while connecting and while
//! sleeping.

use crate::backoff::{Backoff, FixedInterval};
use crate::connector::Connector;
use crate::error::{BoxError, ReadinessError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trace_pipeline::{ActiveSpan, SpanKind, SpanStatus};

/// Name of the span recorded for each connection attempt.
pub const ATTEMPT_SPAN_NAME: &str = "storage.connect";

/// Deadline and retry pacing for a [`ReadinessGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessConfig {
    /// Total time allowed, measured from the first attempt
    pub max_wait: Duration,
    /// Delay between attempts for the default fixed backoff
    pub retry_interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Bookkeeping for the attempt in progress, refreshed on every iteration.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    /// 1-based attempt number
    pub attempt: u32,
    /// When this attempt started
    pub start_time: Instant,
    /// Time since the gate started, measured when the attempt finished
    pub elapsed: Duration,
    /// Message of the previous failure, if any
    pub last_error: Option<String>,
}

/// Blocks startup until a connection to a mandatory dependency succeeds.
pub struct ReadinessGate<C, B = FixedInterval> {
    connector: C,
    backoff: B,
    max_wait: Duration,
}

impl<C: Connector> ReadinessGate<C, FixedInterval> {
    /// A gate retrying at a fixed `retry_interval` until `max_wait` elapses.
    pub fn new(connector: C, config: ReadinessConfig) -> Self {
        Self {
            connector,
            backoff: FixedInterval::new(config.retry_interval),
            max_wait: config.max_wait,
        }
    }
}

impl<C: Connector, B: Backoff> ReadinessGate<C, B> {
    /// Replaces the retry pacing.
    pub fn with_backoff<B2: Backoff>(self, backoff: B2) -> ReadinessGate<C, B2> {
        ReadinessGate {
            connector: self.connector,
            backoff,
            max_wait: self.max_wait,
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Attempts to connect until success, the deadline, or cancellation.
    ///
    /// The first attempt is made immediately. Each failure is logged at ERROR.
    /// An attempt still in flight at the deadline is abandoned and reported as
    /// `DeadlineExceeded`. The result never lands later than the deadline,
    /// and no sleep happens after a successful attempt. Each attempt is
    /// recorded as a child span of `parent`, if given.
    pub async fn acquire(
        &self,
        dsn: &str,
        cancel: &CancellationToken,
        parent: Option<&ActiveSpan<'_>>,
    ) -> Result<C::Connection, ReadinessError> {
        let started = Instant::now();
        let deadline = started + self.max_wait;
        let mut state = ConnectionAttempt {
            attempt: 0,
            start_time: started,
            elapsed: Duration::ZERO,
            last_error: None,
        };
        let mut last_failure: Option<ReadinessError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled(state.attempt, last_failure));
            }

            state.attempt += 1;
            state.start_time = Instant::now();
            tracing::debug!(
                attempt = state.attempt,
                last_error = state.last_error.as_deref(),
                "connecting to dependency"
            );

            let mut span = parent.map(|p| p.child(ATTEMPT_SPAN_NAME));
            if let Some(span) = span.as_mut() {
                span.set_kind(SpanKind::Client);
                span.set_attribute("readiness.attempt", state.attempt);
            }

            let result = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    if let Some(span) = span {
                        span.end_with_status(SpanStatus::error("cancelled"));
                    }
                    return Err(cancelled(state.attempt, last_failure));
                }
                result = self.connector.connect(dsn) => result,
                () = tokio::time::sleep_until(deadline) => {
                    // The attempt in flight is abandoned at the deadline
                    state.elapsed = started.elapsed();
                    let failure = ReadinessError::ConnectionFailed {
                        attempt: state.attempt,
                        source: format!(
                            "attempt still pending after {:?}",
                            state.start_time.elapsed()
                        )
                        .into(),
                    };
                    if let Some(mut span) = span {
                        span.set_attribute("readiness.elapsed_ms", state.elapsed.as_millis() as u64);
                        span.record_error(&failure);
                        span.end();
                    }
                    tracing::error!(
                        attempt = state.attempt,
                        elapsed_ms = state.elapsed.as_millis() as u64,
                        error = %failure,
                        "unable to connect to dependency before the deadline"
                    );
                    return Err(deadline_exceeded(state.attempt, state.elapsed, failure));
                }
            };

            state.elapsed = started.elapsed();
            let elapsed_ms = state.elapsed.as_millis() as u64;
            let attempt_ms = state.start_time.elapsed().as_millis() as u64;
            if let Some(span) = span.as_mut() {
                span.set_attribute("readiness.elapsed_ms", elapsed_ms);
            }

            let failure = match result {
                Ok(connection) => {
                    if let Some(span) = span {
                        span.end_with_status(SpanStatus::Ok);
                    }
                    tracing::info!(attempt = state.attempt, elapsed_ms, attempt_ms, "dependency ready");
                    return Ok(connection);
                }
                Err(e) => {
                    if let Some(mut span) = span {
                        span.record_error(&e);
                        span.end();
                    }
                    ReadinessError::ConnectionFailed {
                        attempt: state.attempt,
                        source: Box::new(e),
                    }
                }
            };

            tracing::error!(
                attempt = state.attempt,
                elapsed_ms,
                attempt_ms,
                error = %failure,
                "unable to connect to dependency, retrying"
            );
            state.last_error = Some(failure.to_string());

            if state.elapsed >= self.max_wait {
                return Err(deadline_exceeded(state.attempt, state.elapsed, failure));
            }
            last_failure = Some(failure);

            let remaining = self.max_wait.saturating_sub(state.elapsed);
            let delay = self.backoff.delay(state.attempt).min(remaining);
            tokio::select! {
                biased;

                () = cancel.cancelled() => return Err(cancelled(state.attempt, last_failure)),
                () = tokio::time::sleep(delay) => {}
            }

            // Waking on the deadline ends the wait without another attempt
            let elapsed = started.elapsed();
            if elapsed >= self.max_wait {
                if let Some(failure) = last_failure.take() {
                    return Err(deadline_exceeded(state.attempt, elapsed, failure));
                }
            }
        }
    }
}

/// Waits for `connector` to succeed, retrying every `retry_interval` for at
/// most `max_wait`.
pub async fn acquire_ready<C: Connector>(
    connector: &C,
    dsn: &str,
    max_wait: Duration,
    retry_interval: Duration,
    cancel: &CancellationToken,
) -> Result<C::Connection, ReadinessError> {
    let config = ReadinessConfig {
        max_wait,
        retry_interval,
    };
    ReadinessGate::new(connector, config)
        .acquire(dsn, cancel, None)
        .await
}

fn deadline_exceeded(attempts: u32, elapsed: Duration, failure: ReadinessError) -> ReadinessError {
    ReadinessError::DeadlineExceeded {
        attempts,
        elapsed,
        cause: Box::new(failure),
    }
}

fn cancelled(attempts: u32, last_failure: Option<ReadinessError>) -> ReadinessError {
    tracing::warn!(attempts, "wait for dependency cancelled");
    ReadinessError::Cancelled {
        attempts,
        last_error: last_failure.map(|f| -> BoxError { Box::new(f) }),
    }
}
