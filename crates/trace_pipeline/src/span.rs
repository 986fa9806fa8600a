use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// A single unit of traced work, as handed to the batching layer once ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Trace identifier (128-bit, never zero)
    pub trace_id: u128,
    /// Span identifier (64-bit, never zero)
    pub span_id: u64,
    /// Parent span identifier, `None` for a root span
    pub parent_span_id: Option<u64>,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds), never earlier than `start_time`
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span attributes (boxed to keep Span size manageable)
    pub attributes: Box<HashMap<String, AttributeValue>>,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
}

/// Attribute value types for span and resource metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error { description: String },
}

impl SpanStatus {
    /// Shorthand for an error status with a description.
    pub fn error(description: impl Into<String>) -> Self {
        Self::Error {
            description: description.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Span kind as defined by OpenTelemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side span for an inbound request
    Server,
    /// Client-side span for an outbound request
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// An ordered group of ended spans, sealed by the batching layer.
///
/// Each batch carries the sequence number it was sealed with, so exporters and
/// tests can observe that batches leave the pipeline in seal order.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// Seal order, starting at 0 for the first batch of a processor
    pub sequence: u64,
    /// All spans in this batch
    pub spans: Vec<Span>,
}

/// Current wall-clock time as Unix nanoseconds.
pub(crate) fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Generates a random, non-zero trace id.
pub(crate) fn new_trace_id() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

/// Generates a random, non-zero span id.
pub(crate) fn new_span_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

impl Span {
    /// Creates a new span starting now
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: Option<u64>,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        let now = unix_nanos_now();

        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now,
            end_time: now,
            name: name.into(),
            attributes: Box::new(HashMap::new()),
            status: SpanStatus::Unset,
            kind,
        }
    }

    /// Marks the span as completed with the given status.
    ///
    /// The end time is clamped so it never precedes the start time, even if the
    /// wall clock stepped backwards while the span was open.
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos_now().max(self.start_time);
        self.status = status;
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Returns true if this span has no parent
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

impl SpanBatch {
    /// Creates a sealed batch with the given spans
    pub fn sealed(sequence: u64, spans: Vec<Span>) -> Self {
        Self { sequence, spans }
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_never_precedes_start() {
        let mut span = Span::new(1, 1, None, "op", SpanKind::Internal);
        // Pretend the span started in the future (clock skew)
        span.start_time = u64::MAX - 1;
        span.finish(SpanStatus::Ok);
        assert!(span.end_time >= span.start_time);
        assert_eq!(span.duration_nanos(), 0);
    }

    #[test]
    fn test_generated_ids_are_non_zero() {
        for _ in 0..1000 {
            assert_ne!(new_trace_id(), 0);
            assert_ne!(new_span_id(), 0);
        }
    }

    #[test]
    fn test_attribute_conversions() {
        let mut span = Span::new(1, 2, Some(1), "op", SpanKind::Server);
        span.set_attribute("http.method", "GET");
        span.set_attribute("http.status_code", 200_i64);
        span.set_attribute("cache.hit", true);

        assert!(!span.is_root());
        assert_eq!(
            span.attributes.get("http.method"),
            Some(&AttributeValue::String("GET".to_string()))
        );
        assert_eq!(span.attributes.get("http.status_code"), Some(&AttributeValue::Int(200)));
        assert_eq!(span.attributes.get("cache.hit"), Some(&AttributeValue::Bool(true)));
    }
}
