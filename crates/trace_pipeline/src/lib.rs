//! Trace Pipeline
//!
//! Wraps units of work in distributed-trace spans and exports them off-process.
//! Ended spans are handed to a bounded queue without blocking, batched by size
//! or age, and exported in seal order by a single background worker: over
//! OTLP/gRPC to a collector, as JSON lines on stdout, or nowhere.
//!
//! ```no_run
//! use trace_pipeline::{init_tracer, ExporterKind, TracingConfig};
//!
//! # async fn run() -> Result<(), trace_pipeline::PipelineError> {
//! let config = TracingConfig::new("product-api").with_exporter(ExporterKind::Stdout);
//! let pipeline = init_tracer(&config).await?;
//!
//! let root = pipeline.tracer().start("init");
//! let child = root.child("storage.connect");
//! child.end();
//! root.end();
//!
//! pipeline.shutdown_handle().shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! There are no process-wide globals: the [`TracerProvider`] and [`Tracer`]
//! are explicit handles, and the pipeline is torn down exactly once through
//! its [`ShutdownHandle`].

pub mod batch_processor;
pub mod error;
pub mod exporter;
mod invariants;
pub mod otlp;
pub mod pipeline;
pub mod processor;
pub mod propagation;
pub mod provider;
pub mod resource;
pub mod span;
pub mod tracer;

// Re-export main types
pub use batch_processor::{BatchConfig, BatchMetrics, BatchProcessor};
pub use error::{ExportError, PipelineError};
pub use exporter::{InMemoryExporter, NullExporter, SpanExporter, SpanExporterBoxed, StdoutExporter};
pub use otlp::{OtlpConfig, OtlpExporter};
pub use pipeline::{init_tracer, init_tracer_with_exporter, ExporterKind, ShutdownHandle, ShutdownOutcome, TracePipeline, TracingConfig};
pub use processor::{BatchSpanProcessor, PipelineMetrics, SpanSink};
pub use propagation::{
    Baggage, BaggagePropagator, CompositePropagator, Extractor, Injector, PropagationContext, TextMapPropagator,
    TraceContextPropagator,
};
pub use provider::TracerProvider;
pub use resource::Resource;
pub use span::{AttributeValue, Span, SpanBatch, SpanKind, SpanStatus};
pub use tracer::{ActiveSpan, Tracer};
