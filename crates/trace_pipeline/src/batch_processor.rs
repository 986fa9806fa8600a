//! Batch Processor - Pure Batching Abstraction
//!
//! Groups ended spans into batches and decides when a batch is sealed. It has
//! no concurrency of its own: the export worker in [`crate::processor`] owns
//! one `BatchProcessor` and feeds it spans from the span queue.
//!
//! # Sealing rules
//!
//! A batch is sealed when either
//!
//! 1. its span count reaches `max_export_batch_size`, or
//! 2. `scheduled_delay` has elapsed since the **first** span of the batch was
//!    added,
//!
//! whichever happens first. An empty processor never seals anything, so an idle
//! service does not produce empty exports.
//!
//! ```rust,ignore
//! use trace_pipeline::{BatchConfig, BatchProcessor};
//!
//! let mut processor = BatchProcessor::new(BatchConfig::default());
//!
//! // Size trigger: `add` hands back the batch as soon as it is full
//! if let Some(batch) = processor.add(span) {
//!     exporter.export_boxed(batch).await?;
//! }
//!
//! // Time trigger: the worker sleeps until `deadline()` and then seals
//! if processor.should_flush() {
//!     let batch = processor.take_batch();
//! }
//! ```
//!
//! # Ownership
//!
//! Sealing moves the pending spans out of the processor into a [`SpanBatch`],
//! so a span belongs to exactly one batch and a batch can only be exported by
//! whoever holds it. Batches carry a sequence number assigned at seal time.

use crate::invariants::{debug_assert_batch_bounded, debug_assert_sequence_advances};
use crate::span::{Span, SpanBatch};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch processing
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of spans per batch
    pub max_export_batch_size: usize,
    /// Maximum time a batch stays open after its first span was added
    pub scheduled_delay: Duration,
    /// Capacity of the queue between span producers and the export worker
    pub max_queue_size: usize,
    /// Upper bound on a single export call
    pub export_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            max_queue_size: 2048,
            export_timeout: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    /// Sets the maximum batch size (clamped to at least 1).
    pub fn with_max_export_batch_size(mut self, size: usize) -> Self {
        self.max_export_batch_size = size.max(1);
        self
    }

    /// Sets the maximum delay before an open batch is sealed.
    pub fn with_scheduled_delay(mut self, delay: Duration) -> Self {
        self.scheduled_delay = delay;
        self
    }

    /// Sets the span queue capacity (clamped to at least 1).
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    /// Sets the per-export timeout.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }
}

/// Metrics for batch processing (plain u64 - no atomic overhead for sequential use)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Total spans accepted into a batch
    pub spans_added: u64,
    /// Batches sealed because they reached the size limit
    pub sealed_by_size: u64,
    /// Batches sealed because their delay elapsed, or on flush/shutdown
    pub sealed_by_time: u64,
}

/// Batch processor that accumulates spans and decides when a batch is sealed.
///
/// This is a pure batching abstraction with no concurrency concerns.
pub struct BatchProcessor {
    /// Spans of the currently open batch, in arrival order
    pending: Vec<Span>,
    /// Configuration
    config: BatchConfig,
    /// Metrics (sequential - no atomics)
    metrics: BatchMetrics,
    /// When the first span of the open batch arrived
    opened_at: Option<Instant>,
    /// Sequence number for the next sealed batch
    next_sequence: u64,
}

impl BatchProcessor {
    /// Creates a new batch processor
    pub fn new(config: BatchConfig) -> Self {
        let capacity = config.max_export_batch_size.max(1);
        Self {
            pending: Vec::with_capacity(capacity.min(4096)),
            config: BatchConfig {
                max_export_batch_size: capacity,
                ..config
            },
            metrics: BatchMetrics::default(),
            opened_at: None,
            next_sequence: 0,
        }
    }

    /// Adds a span to the open batch.
    ///
    /// Returns the sealed batch if this span filled it.
    pub fn add(&mut self, span: Span) -> Option<SpanBatch> {
        if self.pending.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.pending.push(span);
        self.metrics.spans_added += 1;

        if self.pending.len() >= self.config.max_export_batch_size {
            self.metrics.sealed_by_size += 1;
            return self.seal();
        }
        None
    }

    /// Returns the number of spans in the open batch
    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    /// Instant at which the open batch must be sealed, if a batch is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.config.scheduled_delay)
    }

    /// Checks if the open batch should be sealed now
    pub fn should_flush(&self) -> bool {
        !self.pending.is_empty()
            && (self.pending.len() >= self.config.max_export_batch_size
                || self.deadline().is_some_and(|deadline| Instant::now() >= deadline))
    }

    /// Seals the open batch regardless of thresholds.
    ///
    /// Returns `None` if no spans are pending.
    pub fn take_batch(&mut self) -> Option<SpanBatch> {
        if self.pending.is_empty() {
            return None;
        }
        self.metrics.sealed_by_time += 1;
        self.seal()
    }

    fn seal(&mut self) -> Option<SpanBatch> {
        let spans = std::mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.config.max_export_batch_size.min(4096)),
        );
        self.opened_at = None;

        debug_assert_batch_bounded!(spans.len(), self.config.max_export_batch_size);

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug_assert_sequence_advances!(sequence, self.next_sequence);

        Some(SpanBatch::sealed(sequence, spans))
    }

    /// Number of batches sealed so far
    pub fn sealed_batches(&self) -> u64 {
        self.next_sequence
    }

    /// Returns the configuration in effect
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Returns current metrics
    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}
