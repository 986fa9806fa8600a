//! Pipeline construction and the bound shutdown procedure.

use crate::batch_processor::BatchConfig;
use crate::error::PipelineError;
use crate::exporter::{NullExporter, SpanExporterBoxed, StdoutExporter};
use crate::otlp::{OtlpConfig, OtlpExporter};
use crate::propagation::CompositePropagator;
use crate::provider::TracerProvider;
use crate::resource::Resource;
use crate::tracer::Tracer;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Where finished spans go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExporterKind {
    /// OTLP over gRPC to a collector
    #[default]
    Otlp,
    /// JSON lines on stdout
    Stdout,
    /// Discard everything
    None,
}

impl FromStr for ExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "otlp" => Ok(Self::Otlp),
            "stdout" => Ok(Self::Stdout),
            "none" | "noop" => Ok(Self::None),
            other => Err(format!("unknown trace exporter {other:?} (expected otlp, stdout or none)")),
        }
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Otlp => "otlp",
            Self::Stdout => "stdout",
            Self::None => "none",
        })
    }
}

/// Everything needed to build a [`TracePipeline`].
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub exporter: ExporterKind,
    /// Collector URL, used by [`ExporterKind::Otlp`]
    pub collector_endpoint: String,
    pub batch: BatchConfig,
    /// Budget for draining buffered spans at shutdown
    pub shutdown_timeout: Duration,
    /// Continue with a discarding exporter if the real one cannot be built
    pub fallback_to_noop: bool,
    /// Check collector reachability while building the exporter
    pub connect_eagerly: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown_service".to_string(),
            service_version: None,
            exporter: ExporterKind::Otlp,
            collector_endpoint: "http://localhost:4317".to_string(),
            batch: BatchConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            fallback_to_noop: false,
            connect_eagerly: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_exporter(mut self, exporter: ExporterKind) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_collector_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.collector_endpoint = endpoint.into();
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn resource(&self) -> Resource {
        let resource = Resource::new(self.service_name.clone());
        match &self.service_version {
            Some(version) => resource.with_version(version.clone()),
            None => resource,
        }
    }
}

/// A configured pipeline: provider, tracer, propagator and the one shutdown
/// procedure that must run before the process exits.
pub struct TracePipeline {
    provider: TracerProvider,
    tracer: Tracer,
    propagator: Arc<CompositePropagator>,
    shutdown: ShutdownHandle,
}

impl TracePipeline {
    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    pub fn propagator(&self) -> Arc<CompositePropagator> {
        Arc::clone(&self.propagator)
    }

    /// Name of the exporter spans are sent to.
    pub fn exporter_name(&self) -> &str {
        self.shutdown.inner.exporter.name()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}

impl fmt::Debug for TracePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracePipeline")
            .field("provider", &self.provider)
            .field("exporter", &self.exporter_name())
            .finish()
    }
}

/// Builds the exporter named by `config` and wires the pipeline around it.
///
/// Must be called from within a Tokio runtime. If the exporter cannot be
/// built the error is returned, unless `fallback_to_noop` is set, in which
/// case it is logged and spans are discarded.
pub async fn init_tracer(config: &TracingConfig) -> Result<TracePipeline, PipelineError> {
    let resource = config.resource();

    let exporter = match build_exporter(config, resource).await {
        Ok(exporter) => exporter,
        Err(err) if config.fallback_to_noop => {
            tracing::error!(error = %err, "span exporter unavailable, spans will be discarded");
            Arc::new(NullExporter::new())
        }
        Err(err) => return Err(err),
    };

    Ok(init_tracer_with_exporter(config, exporter))
}

/// Wires a pipeline around a caller-supplied exporter. Tests use this to
/// substitute a recording exporter per run.
pub fn init_tracer_with_exporter(config: &TracingConfig, exporter: Arc<dyn SpanExporterBoxed>) -> TracePipeline {
    let provider = TracerProvider::new(
        config.resource(),
        config.batch.clone(),
        Arc::clone(&exporter),
        config.shutdown_timeout,
    );

    tracing::info!(
        service = %config.service_name,
        exporter = exporter.name(),
        batch_size = config.batch.max_export_batch_size,
        "trace pipeline started"
    );

    TracePipeline {
        tracer: provider.tracer(),
        propagator: Arc::new(CompositePropagator::w3c()),
        shutdown: ShutdownHandle {
            inner: Arc::new(ShutdownInner {
                provider: provider.clone(),
                exporter,
                timeout: config.shutdown_timeout,
                done: AtomicBool::new(false),
            }),
        },
        provider,
    }
}

async fn build_exporter(config: &TracingConfig, resource: Resource) -> Result<Arc<dyn SpanExporterBoxed>, PipelineError> {
    Ok(match config.exporter {
        ExporterKind::Otlp => {
            let otlp = OtlpConfig::new(config.collector_endpoint.clone())
                .with_timeout(config.batch.export_timeout)
                .with_connect_eagerly(config.connect_eagerly);
            Arc::new(OtlpExporter::new(&otlp, resource).await?)
        }
        ExporterKind::Stdout => Arc::new(StdoutExporter::new(resource)),
        ExporterKind::None => Arc::new(NullExporter::new()),
    })
}

/// What a call to [`ShutdownHandle::shutdown`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Both steps succeeded
    Completed,
    /// Both steps were attempted; this many failed and were logged
    CompletedWithErrors(usize),
    /// An earlier call already ran the procedure
    AlreadyShutdown,
}

/// The bound teardown procedure for one pipeline.
///
/// Clones share state: the procedure runs once no matter how many clones
/// call it.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    provider: TracerProvider,
    exporter: Arc<dyn SpanExporterBoxed>,
    /// Bounds each step separately
    timeout: Duration,
    done: AtomicBool,
}

impl ShutdownHandle {
    /// Drains buffered spans through the provider, then closes the exporter.
    ///
    /// Both steps are always attempted, each bounded by the configured
    /// shutdown timeout. Failures are logged at ERROR and
    /// counted in the outcome, never returned.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            tracing::debug!("trace pipeline shutdown already ran");
            return ShutdownOutcome::AlreadyShutdown;
        }

        let mut failures = 0;

        if let Err(err) = self.inner.provider.shutdown().await {
            if !err.is_benign() {
                log_step_failure("provider", &err.to_string());
                failures += 1;
            }
        }

        match tokio::time::timeout(self.inner.timeout, self.inner.exporter.shutdown_boxed()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log_step_failure("exporter", &err.to_string());
                failures += 1;
            }
            Err(_) => {
                log_step_failure("exporter", &format!("close did not finish within {:?}", self.inner.timeout));
                failures += 1;
            }
        }

        let metrics = self.inner.provider.metrics();
        tracing::info!(
            exported = metrics.spans_exported(),
            dropped = metrics.spans_dropped(),
            failures,
            "trace pipeline shut down"
        );

        if failures == 0 {
            ShutdownOutcome::Completed
        } else {
            ShutdownOutcome::CompletedWithErrors(failures)
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn log_step_failure(step: &'static str, reason: &str) {
    let err = PipelineError::ShutdownStepFailed {
        step,
        reason: reason.to_string(),
    };
    tracing::error!(error = %err, "trace pipeline shutdown step failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;

    #[test]
    fn test_exporter_kind_parsing() {
        assert_eq!("OTLP".parse::<ExporterKind>().unwrap(), ExporterKind::Otlp);
        assert_eq!("stdout".parse::<ExporterKind>().unwrap(), ExporterKind::Stdout);
        assert_eq!("none".parse::<ExporterKind>().unwrap(), ExporterKind::None);
        assert!("jaeger".parse::<ExporterKind>().is_err());
        assert_eq!(ExporterKind::Stdout.to_string(), "stdout");
    }

    #[test]
    fn test_resource_carries_service_identity() {
        let mut config = TracingConfig::new("product-api");
        config.service_version = Some("1.2.3".to_string());
        let resource = config.resource();
        assert_eq!(resource.service_name(), "product-api");
        assert!(resource.get(crate::resource::SERVICE_VERSION).is_some());
    }

    #[tokio::test]
    async fn test_malformed_endpoint_is_fatal_by_default() {
        let config = TracingConfig::new("svc").with_collector_endpoint("localhost:4317 nope");
        let err = init_tracer(&config).await.unwrap_err();
        assert!(matches!(err, PipelineError::ExporterInitFailed(_)));
    }

    #[tokio::test]
    async fn test_fallback_to_noop_keeps_running() {
        let mut config = TracingConfig::new("svc").with_collector_endpoint("grpc://");
        config.fallback_to_noop = true;
        let pipeline = init_tracer(&config).await.unwrap();
        assert_eq!(pipeline.exporter_name(), "null");
        pipeline.tracer().start("still works").end();
        assert_eq!(pipeline.shutdown_handle().shutdown().await, ShutdownOutcome::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let exporter = Arc::new(InMemoryExporter::new());
        let pipeline = init_tracer_with_exporter(&TracingConfig::new("svc"), exporter.clone());
        let handle = pipeline.shutdown_handle();

        assert_eq!(handle.shutdown().await, ShutdownOutcome::Completed);
        assert_eq!(handle.clone().shutdown().await, ShutdownOutcome::AlreadyShutdown);
        assert_eq!(exporter.shutdown_calls(), 1);
        assert!(handle.is_shutdown());
    }

    #[tokio::test]
    async fn test_exporter_shutdown_failure_is_counted_not_returned() {
        let exporter = Arc::new(InMemoryExporter::new().with_failing_shutdown());
        let pipeline = init_tracer_with_exporter(&TracingConfig::new("svc"), exporter.clone());
        pipeline.tracer().start("work").end();

        let outcome = pipeline.shutdown_handle().shutdown().await;
        assert_eq!(outcome, ShutdownOutcome::CompletedWithErrors(1));
        // The provider step still drained the span before the exporter closed
        assert_eq!(exporter.exported_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_exporter_close_is_bounded() {
        let exporter = Arc::new(InMemoryExporter::new().with_stalled_shutdown());
        let config = TracingConfig::new("svc").with_shutdown_timeout(Duration::from_secs(2));
        let pipeline = init_tracer_with_exporter(&config, exporter.clone());
        pipeline.tracer().start("work").end();

        let started = tokio::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_secs(600), pipeline.shutdown_handle().shutdown())
            .await
            .expect("shutdown hung on exporter close");

        assert_eq!(outcome, ShutdownOutcome::CompletedWithErrors(1));
        assert!(started.elapsed() <= Duration::from_secs(2), "waited {:?}", started.elapsed());
        assert_eq!(exporter.exported_count(), 1);
        assert_eq!(exporter.shutdown_calls(), 1);
    }
}
