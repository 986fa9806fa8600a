//! Trace context propagation across process boundaries.
//!
//! Implements the two W3C header encodings:
//!
//! - `traceparent`: `{version}-{trace-id}-{parent-id}-{trace-flags}`, e.g.
//!   `00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01`
//! - `baggage`: comma separated `key=value` members with percent-encoded values,
//!   e.g. `userId=alice,serverNode=DF%2028`
//!
//! Carriers are abstracted behind [`Injector`] and [`Extractor`] so the same
//! propagators work with HTTP header maps, gRPC metadata or a plain `HashMap`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Header carrying trace identity.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header carrying baggage.
pub const BAGGAGE_HEADER: &str = "baggage";

const SUPPORTED_VERSION: u8 = 0;
const FLAG_SAMPLED: u8 = 0x01;
const MAX_BAGGAGE_MEMBERS: usize = 180;
const MAX_BAGGAGE_BYTES: usize = 8192;

/// Immutable key/value pairs that travel with the trace.
///
/// Cloning is cheap; mutation copies on write.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Baggage(Arc<BTreeMap<String, String>>);

impl Baggage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns a copy of this baggage with `key` set to `value`.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        Arc::make_mut(&mut self.0).insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Baggage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

/// Trace identity carried across a process boundary.
///
/// Read-only once received; derive a fresh one from the current span for each
/// outbound call (see `ActiveSpan::context`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationContext {
    /// Trace identifier, 0 if no trace was received
    pub trace_id: u128,
    /// Span to parent new spans under, `None` if no trace was received
    pub parent_span_id: Option<u64>,
    /// Whether the upstream decided to record this trace
    pub sampled: bool,
    /// Baggage received with (or attached to) the trace
    pub baggage: Baggage,
}

impl PropagationContext {
    /// A context with no trace identity and no baggage.
    pub fn empty() -> Self {
        Self {
            trace_id: 0,
            parent_span_id: None,
            sampled: true,
            baggage: Baggage::new(),
        }
    }

    /// Returns `true` if this context identifies a remote parent span.
    pub fn is_valid(&self) -> bool {
        self.trace_id != 0 && self.parent_span_id.is_some_and(|id| id != 0)
    }

    /// Encodes the `traceparent` header value, if the context is valid.
    pub fn to_traceparent(&self) -> Option<String> {
        let parent = self.parent_span_id.filter(|_| self.is_valid())?;
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        Some(format!(
            "{:02x}-{:032x}-{:016x}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, parent, flags
        ))
    }
}

impl Default for PropagationContext {
    fn default() -> Self {
        Self::empty()
    }
}

/// Write side of a carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

/// Read side of a carrier. Keys are looked up in lowercase.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_ascii_lowercase(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, &key.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Encodes and decodes one aspect of a [`PropagationContext`] in a carrier.
pub trait TextMapPropagator: Send + Sync {
    /// Writes this propagator's header(s) for `cx` into the carrier.
    fn inject(&self, cx: &PropagationContext, injector: &mut dyn Injector);

    /// Reads this propagator's header(s) and merges them into `cx`.
    fn extract_into(&self, extractor: &dyn Extractor, cx: PropagationContext) -> PropagationContext;

    /// Header names this propagator reads and writes.
    fn fields(&self) -> &'static [&'static str];
}

/// W3C `traceparent` propagator.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextPropagator;

impl TextMapPropagator for TraceContextPropagator {
    fn inject(&self, cx: &PropagationContext, injector: &mut dyn Injector) {
        if let Some(header) = cx.to_traceparent() {
            injector.set(TRACEPARENT_HEADER, header);
        }
    }

    fn extract_into(&self, extractor: &dyn Extractor, mut cx: PropagationContext) -> PropagationContext {
        if let Some((trace_id, parent_span_id, flags)) =
            extractor.get(TRACEPARENT_HEADER).and_then(parse_traceparent)
        {
            cx.trace_id = trace_id;
            cx.parent_span_id = Some(parent_span_id);
            cx.sampled = flags & FLAG_SAMPLED != 0;
        }
        cx
    }

    fn fields(&self) -> &'static [&'static str] {
        &[TRACEPARENT_HEADER]
    }
}

/// W3C `baggage` propagator.
#[derive(Debug, Default, Clone, Copy)]
pub struct BaggagePropagator;

impl TextMapPropagator for BaggagePropagator {
    fn inject(&self, cx: &PropagationContext, injector: &mut dyn Injector) {
        let header = cx
            .baggage
            .iter()
            .filter(|(key, _)| is_token(key))
            .take(MAX_BAGGAGE_MEMBERS)
            .map(|(key, value)| format!("{}={}", key, percent_encode(value)))
            .collect::<Vec<_>>()
            .join(",");

        if !header.is_empty() && header.len() <= MAX_BAGGAGE_BYTES {
            injector.set(BAGGAGE_HEADER, header);
        }
    }

    fn extract_into(&self, extractor: &dyn Extractor, mut cx: PropagationContext) -> PropagationContext {
        let Some(header) = extractor.get(BAGGAGE_HEADER) else {
            return cx;
        };
        if header.len() > MAX_BAGGAGE_BYTES {
            return cx;
        }

        for member in header.split(',').take(MAX_BAGGAGE_MEMBERS) {
            // Member properties (`;prop=value`) are not kept
            let pair = member.split(';').next().unwrap_or_default();
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if !is_token(key) {
                continue;
            }
            if let Some(value) = percent_decode(value.trim()) {
                cx.baggage.insert(key, value);
            }
        }
        cx
    }

    fn fields(&self) -> &'static [&'static str] {
        &[BAGGAGE_HEADER]
    }
}

/// Runs several propagators in order.
pub struct CompositePropagator {
    propagators: Vec<Box<dyn TextMapPropagator>>,
}

impl CompositePropagator {
    pub fn new(propagators: Vec<Box<dyn TextMapPropagator>>) -> Self {
        Self { propagators }
    }

    /// Trace context plus baggage, the default for this service.
    pub fn w3c() -> Self {
        Self::new(vec![Box::new(TraceContextPropagator), Box::new(BaggagePropagator)])
    }

    /// Writes every propagator's header(s) into the carrier.
    pub fn inject(&self, cx: &PropagationContext, injector: &mut dyn Injector) {
        for propagator in &self.propagators {
            propagator.inject(cx, injector);
        }
    }

    /// Builds a context from the carrier. Missing or malformed headers leave
    /// the corresponding part empty rather than failing.
    pub fn extract(&self, extractor: &dyn Extractor) -> PropagationContext {
        self.propagators
            .iter()
            .fold(PropagationContext::empty(), |cx, propagator| {
                propagator.extract_into(extractor, cx)
            })
    }

    /// All header names handled by this propagator.
    pub fn fields(&self) -> Vec<&'static str> {
        self.propagators
            .iter()
            .flat_map(|p| p.fields().iter().copied())
            .collect()
    }
}

impl Default for CompositePropagator {
    fn default() -> Self {
        Self::w3c()
    }
}

impl fmt::Debug for CompositePropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositePropagator")
            .field("fields", &self.fields())
            .finish()
    }
}

/// Parses a `traceparent` value into `(trace_id, parent_span_id, flags)`.
pub fn parse_traceparent(value: &str) -> Option<(u128, u64, u8)> {
    let parts: Vec<&str> = value.trim().split('-').collect();
    if parts.len() < 4 {
        return None;
    }

    let version = parse_hex_field(parts[0], 2)? as u8;
    // 0xff is forbidden; version 00 has exactly four fields, later versions may add more
    if version == 0xff || (version == SUPPORTED_VERSION && parts.len() != 4) {
        return None;
    }

    let trace_id = parse_hex_field(parts[1], 32)?;
    let span_id = parse_hex_field(parts[2], 16)? as u64;
    let flags = parse_hex_field(parts[3], 2)? as u8;

    if trace_id == 0 || span_id == 0 {
        return None;
    }
    Some((trace_id, span_id, flags))
}

fn parse_hex_field(field: &str, len: usize) -> Option<u128> {
    let lower_hex = field
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if field.len() != len || !lower_hex {
        return None;
    }
    u128::from_str_radix(field, 16).ok()
}

/// RFC 7230 token characters, as required for baggage keys.
fn is_token(key: &str) -> bool {
    !key.is_empty()
        && key.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        let plain = (0x21..=0x7e).contains(&b) && !matches!(b, b'"' | b',' | b';' | b'\\' | b'%');
        if plain {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn percent_decode(value: &str) -> Option<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
