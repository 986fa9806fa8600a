//! Span creation.
//!
//! A [`Tracer`] starts root spans or spans continuing a remote trace. An
//! [`ActiveSpan`] starts its children through [`ActiveSpan::child`], which
//! borrows the parent: the borrow checker guarantees a child is ended before
//! its parent can be, so parent/child nesting always matches call nesting.
//!
//! Ending a span (explicitly or by dropping it) hands an immutable [`Span`]
//! record to the batching queue without blocking.

use crate::invariants::debug_assert_span_ordered;
use crate::processor::SpanSink;
use crate::propagation::{Baggage, PropagationContext};
use crate::span::{new_span_id, new_trace_id, unix_nanos_now, AttributeValue, Span, SpanKind, SpanStatus};
use std::collections::HashMap;
use std::error::Error;
use std::marker::PhantomData;
use std::time::Instant;

/// Creates spans that are delivered to one pipeline.
#[derive(Clone)]
pub struct Tracer {
    sink: Option<SpanSink>,
}

impl Tracer {
    pub(crate) fn new(sink: SpanSink) -> Self {
        Self { sink: Some(sink) }
    }

    /// A tracer whose spans are never recorded. Components accept this when
    /// tracing is turned off.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Returns `true` if spans from this tracer reach an exporter.
    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Starts a new root span in a new trace.
    pub fn start(&self, name: impl Into<String>) -> ActiveSpan<'static> {
        ActiveSpan::open(
            None,
            self.sink.clone(),
            new_trace_id(),
            None,
            name.into(),
            true,
            Baggage::new(),
        )
    }

    /// Starts a span under a remote parent received through propagation.
    ///
    /// If `cx` carries no valid trace identity, a new trace is started but the
    /// received baggage is kept.
    pub fn start_with_parent(&self, name: impl Into<String>, cx: &PropagationContext) -> ActiveSpan<'static> {
        if cx.is_valid() {
            ActiveSpan::open(
                None,
                self.sink.clone(),
                cx.trace_id,
                cx.parent_span_id,
                name.into(),
                cx.sampled,
                cx.baggage.clone(),
            )
        } else {
            ActiveSpan::open(
                None,
                self.sink.clone(),
                new_trace_id(),
                None,
                name.into(),
                true,
                cx.baggage.clone(),
            )
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// An open span. Ends when [`ActiveSpan::end`] is called or when dropped.
///
/// The lifetime ties a child span to the parent it was started from.
pub struct ActiveSpan<'parent> {
    trace_id: u128,
    span_id: u64,
    parent_span_id: Option<u64>,
    name: String,
    kind: SpanKind,
    start_time: u64,
    /// Wall-clock/monotonic pair shared by all local spans of a trace, so
    /// their timestamps come from one monotonic clock
    epoch: (u64, Instant),
    attributes: HashMap<String, AttributeValue>,
    status: SpanStatus,
    sampled: bool,
    baggage: Baggage,
    sink: Option<SpanSink>,
    ended: bool,
    _parent: PhantomData<&'parent ()>,
}

impl<'parent> ActiveSpan<'parent> {
    fn open(
        epoch: Option<(u64, Instant)>,
        sink: Option<SpanSink>,
        trace_id: u128,
        parent_span_id: Option<u64>,
        name: String,
        sampled: bool,
        baggage: Baggage,
    ) -> Self {
        let epoch = epoch.unwrap_or_else(|| (unix_nanos_now(), Instant::now()));
        Self {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
            name,
            kind: SpanKind::Internal,
            start_time: epoch.0.saturating_add(epoch.1.elapsed().as_nanos() as u64),
            epoch,
            attributes: HashMap::new(),
            status: SpanStatus::Unset,
            sampled,
            baggage,
            sink,
            ended: false,
            _parent: PhantomData,
        }
    }

    /// Starts a child span. The child must end before `self` can.
    pub fn child(&self, name: impl Into<String>) -> ActiveSpan<'_> {
        ActiveSpan::open(
            Some(self.epoch),
            self.sink.clone(),
            self.trace_id,
            Some(self.span_id),
            name.into(),
            self.sampled,
            self.baggage.clone(),
        )
    }

    pub fn trace_id(&self) -> u128 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    pub fn parent_span_id(&self) -> Option<u64> {
        self.parent_span_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    /// Returns `true` if this span will be handed to an exporter when it ends.
    pub fn is_recording(&self) -> bool {
        self.sampled && self.sink.is_some()
    }

    pub fn set_kind(&mut self, kind: SpanKind) {
        self.kind = kind;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        self.status = status;
    }

    /// Marks the span failed and records the error message.
    pub fn record_error(&mut self, error: &(dyn Error + 'static)) {
        let message = error.to_string();
        self.attributes
            .insert("exception.message".to_string(), AttributeValue::String(message.clone()));
        self.status = SpanStatus::Error { description: message };
    }

    /// Adds a baggage entry that children and outbound calls will carry.
    pub fn insert_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key, value);
    }

    /// Context to inject into an outbound request made on behalf of this span.
    pub fn context(&self) -> PropagationContext {
        PropagationContext {
            trace_id: self.trace_id,
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    /// Ends the span with its current status.
    pub fn end(mut self) {
        self.end_inner();
    }

    /// Sets the status and ends the span.
    pub fn end_with_status(mut self, status: SpanStatus) {
        self.status = status;
        self.end_inner();
    }

    fn end_inner(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        // Monotonic offset from the epoch, so end never precedes start even if
        // the wall clock steps back
        let end_time = self
            .epoch
            .0
            .saturating_add(self.epoch.1.elapsed().as_nanos() as u64)
            .max(self.start_time);
        debug_assert_span_ordered!(self.start_time, end_time);

        let Some(sink) = self.sink.take().filter(|_| self.sampled) else {
            return;
        };

        let span = Span {
            trace_id: self.trace_id,
            span_id: self.span_id,
            parent_span_id: self.parent_span_id,
            start_time: self.start_time,
            end_time,
            name: std::mem::take(&mut self.name),
            attributes: Box::new(std::mem::take(&mut self.attributes)),
            status: std::mem::replace(&mut self.status, SpanStatus::Unset),
            kind: self.kind,
        };
        sink.submit(span);
    }
}

impl Drop for ActiveSpan<'_> {
    fn drop(&mut self) {
        self.end_inner();
    }
}

impl std::fmt::Debug for ActiveSpan<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("trace_id", &format_args!("{:032x}", self.trace_id))
            .field("span_id", &format_args!("{:016x}", self.span_id))
            .field("name", &self.name)
            .field("recording", &self.is_recording())
            .finish()
    }
}
