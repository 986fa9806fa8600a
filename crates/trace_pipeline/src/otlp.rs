//! OTLP/gRPC span exporter.
//!
//! Spans are converted to the collector's protobuf model and sent through the
//! generated `TraceService` client. The channel connects lazily unless the
//! caller asks for an eager connection check at startup.

use crate::error::{ExportError, PipelineError};
use crate::exporter::SpanExporter;
use crate::resource::Resource;
use crate::span::{AttributeValue, Span, SpanBatch, SpanKind, SpanStatus};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, ArrayValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_proto::tonic::trace::v1::{self as proto, span, status, ResourceSpans, ScopeSpans};
use prost::Message;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use url::Url;

/// Instrumentation scope reported with every exported span.
pub const SCOPE_NAME: &str = "trace_pipeline";

/// Connection settings for [`OtlpExporter`].
#[derive(Debug, Clone)]
pub struct OtlpConfig {
    /// Collector URL, e.g. `http://localhost:4317`
    pub endpoint: String,
    /// Per-request timeout applied by the channel
    pub timeout: Duration,
    /// Connect during construction and fail if the collector is unreachable
    pub connect_eagerly: bool,
    /// Budget for the eager connection attempt
    pub connect_timeout: Duration,
}

impl OtlpConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(10),
            connect_eagerly: false,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_eagerly(mut self, eager: bool) -> Self {
        self.connect_eagerly = eager;
        self
    }
}

/// Exports span batches to an OpenTelemetry collector over gRPC.
pub struct OtlpExporter {
    endpoint: String,
    resource: Resource,
    client: Mutex<Option<TraceServiceClient<Channel>>>,
}

impl OtlpExporter {
    /// Builds the exporter. A malformed endpoint always fails; an unreachable
    /// collector fails only when `connect_eagerly` is set.
    pub async fn new(config: &OtlpConfig, resource: Resource) -> Result<Self, PipelineError> {
        let endpoint = validate_endpoint(&config.endpoint)?;
        let builder = Endpoint::from_shared(endpoint.clone())
            .map_err(|e| PipelineError::ExporterInitFailed(format!("{endpoint}: {e}")))?
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        let channel = if config.connect_eagerly {
            builder.connect().await.map_err(|e| {
                PipelineError::ExporterInitFailed(format!("collector {endpoint} unreachable: {e}"))
            })?
        } else {
            builder.connect_lazy()
        };

        tracing::debug!(endpoint = %endpoint, eager = config.connect_eagerly, "OTLP exporter configured");

        Ok(Self {
            endpoint,
            resource,
            client: Mutex::new(Some(TraceServiceClient::new(channel))),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn client(&self) -> Option<TraceServiceClient<Channel>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SpanExporter for OtlpExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        // Clone out of the lock; the client is a cheap handle over the channel
        let Some(mut client) = self.client() else {
            return Err(ExportError::Shutdown);
        };

        let sequence = batch.sequence;
        let request = to_export_request(&self.resource, &batch);
        tracing::debug!(
            batch = sequence,
            spans = batch.len(),
            bytes = request.encoded_len(),
            "sending spans to collector"
        );

        let response = client
            .export(request)
            .await
            .map_err(|status| ExportError::Transport(status.to_string()))?
            .into_inner();

        if let Some(partial) = response.partial_success {
            if partial.rejected_spans > 0 {
                tracing::warn!(
                    batch = sequence,
                    rejected = partial.rejected_spans,
                    message = %partial.error_message,
                    "collector rejected part of a batch"
                );
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match client {
            Some(_) => Ok(()),
            None => Err(ExportError::Shutdown),
        }
    }

    fn name(&self) -> &str {
        "otlp"
    }
}

/// Accepts only `http`/`https` URLs with a host.
fn validate_endpoint(raw: &str) -> Result<String, PipelineError> {
    let url = Url::parse(raw)
        .map_err(|e| PipelineError::ExporterInitFailed(format!("invalid collector endpoint {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PipelineError::ExporterInitFailed(format!(
            "collector endpoint {raw:?} must use http or https"
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(PipelineError::ExporterInitFailed(format!(
            "collector endpoint {raw:?} has no host"
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

/// Converts a sealed batch into one OTLP export request.
pub fn to_export_request(resource: &Resource, batch: &SpanBatch) -> ExportTraceServiceRequest {
    let resource = ProtoResource {
        attributes: resource.iter().map(|(k, v)| key_value(k, v)).collect(),
        ..Default::default()
    };
    let scope = InstrumentationScope {
        name: SCOPE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    };

    ExportTraceServiceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Some(resource),
            scope_spans: vec![ScopeSpans {
                scope: Some(scope),
                spans: batch.spans.iter().map(to_proto_span).collect(),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn to_proto_span(span: &Span) -> proto::Span {
    let mut attributes: Vec<KeyValue> = span.attributes.iter().map(|(k, v)| key_value(k, v)).collect();
    // HashMap order is random; keep the wire form stable
    attributes.sort_by(|a, b| a.key.cmp(&b.key));

    proto::Span {
        trace_id: span.trace_id.to_be_bytes().to_vec(),
        span_id: span.span_id.to_be_bytes().to_vec(),
        parent_span_id: span
            .parent_span_id
            .map(|id| id.to_be_bytes().to_vec())
            .unwrap_or_default(),
        name: span.name.clone(),
        kind: proto_kind(span.kind) as i32,
        start_time_unix_nano: span.start_time,
        end_time_unix_nano: span.end_time,
        attributes,
        status: Some(proto_status(&span.status)),
        ..Default::default()
    }
}

fn proto_kind(kind: SpanKind) -> span::SpanKind {
    match kind {
        SpanKind::Internal => span::SpanKind::Internal,
        SpanKind::Server => span::SpanKind::Server,
        SpanKind::Client => span::SpanKind::Client,
        SpanKind::Producer => span::SpanKind::Producer,
        SpanKind::Consumer => span::SpanKind::Consumer,
    }
}

fn proto_status(status: &SpanStatus) -> proto::Status {
    match status {
        SpanStatus::Unset => proto::Status {
            code: status::StatusCode::Unset as i32,
            ..Default::default()
        },
        SpanStatus::Ok => proto::Status {
            code: status::StatusCode::Ok as i32,
            ..Default::default()
        },
        SpanStatus::Error { description } => proto::Status {
            code: status::StatusCode::Error as i32,
            message: description.clone(),
        },
    }
}

fn key_value(key: &str, value: &AttributeValue) -> KeyValue {
    let value = match value {
        AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
        AttributeValue::Int(i) => any_value::Value::IntValue(*i),
        AttributeValue::Float(f) => any_value::Value::DoubleValue(*f),
        AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
        AttributeValue::Array(items) => any_value::Value::ArrayValue(ArrayValue {
            values: items
                .iter()
                .map(|s| AnyValue {
                    value: Some(any_value::Value::StringValue(s.clone())),
                })
                .collect(),
        }),
    };
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue { value: Some(value) }),
    }
}
