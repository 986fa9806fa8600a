//! Debug assertion macros for pipeline invariants.
//!
//! Only active in debug builds, so there is no overhead in release builds.

// =============================================================================
// Span lifetime
// =============================================================================

/// Assert that a span does not end before it started.
///
/// **Invariant**: `end_time >= start_time`
///
/// Used in: `ActiveSpan::end_inner()`
macro_rules! debug_assert_span_ordered {
    ($start:expr, $end:expr) => {
        debug_assert!(
            $end >= $start,
            "span ended at {} before it started at {}",
            $end,
            $start
        )
    };
}

// =============================================================================
// Batch sealing
// =============================================================================

/// Assert that a sealed batch never exceeds the configured size.
///
/// **Invariant**: `0 < batch.len() <= max_export_batch_size`
///
/// Used in: `BatchProcessor::seal()`
macro_rules! debug_assert_batch_bounded {
    ($len:expr, $max:expr) => {
        debug_assert!(
            $len > 0 && $len <= $max,
            "sealed batch of {} spans outside 1..={}",
            $len,
            $max
        )
    };
}

/// Assert that batch sequence numbers strictly increase.
///
/// **Invariant**: `next_sequence == sealed_sequence + 1`
///
/// Used in: `BatchProcessor::seal()`
macro_rules! debug_assert_sequence_advances {
    ($sealed:expr, $next:expr) => {
        debug_assert!(
            $next == $sealed + 1,
            "batch sequence did not advance: sealed {} next {}",
            $sealed,
            $next
        )
    };
}

// =============================================================================
// Export ordering
// =============================================================================

/// Assert that batches reach the exporter in seal order, each exactly once.
///
/// **Invariant**: `batch.sequence > last_handed_over` (any sequence for the first)
///
/// Used in: export worker before each export call
macro_rules! debug_assert_export_in_order {
    ($last:expr, $sequence:expr) => {
        debug_assert!(
            match $last {
                None => true,
                Some(last) => $sequence > last,
            },
            "batch {} handed to exporter after batch {:?}",
            $sequence,
            $last
        )
    };
}

pub(crate) use debug_assert_batch_bounded;
pub(crate) use debug_assert_export_in_order;
pub(crate) use debug_assert_sequence_advances;
pub(crate) use debug_assert_span_ordered;
