use crate::error::ExportError;
use crate::resource::Resource;
use crate::span::{Span, SpanBatch};
use std::future::Future;
use std::io::Write;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Trait for exporting sealed span batches to a backend.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`; every `SpanExporter`
/// gets it through the blanket impl below.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans. Called at most once per batch.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Releases transport resources. Later exports fail with `ExportError::Shutdown`.
    fn shutdown(&self) -> impl Future<Output = Result<(), ExportError>> + Send {
        async { Ok(()) }
    }

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Boxed future returned by [`SpanExporterBoxed`].
pub type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(&self, batch: SpanBatch) -> ExportFuture<'_>;

    /// Shuts the exporter down (boxed future for object safety).
    fn shutdown_boxed(&self) -> ExportFuture<'_>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(&self, batch: SpanBatch) -> ExportFuture<'_> {
        Box::pin(self.export(batch))
    }

    fn shutdown_boxed(&self) -> ExportFuture<'_> {
        Box::pin(self.shutdown())
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Writes each span as one JSON line on stdout. Meant for local development.
pub struct StdoutExporter {
    resource: Resource,
}

impl StdoutExporter {
    pub fn new(resource: Resource) -> Self {
        Self { resource }
    }
}

impl SpanExporter for StdoutExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let mut out = Vec::with_capacity(batch.len() * 256);
        for span in &batch.spans {
            let line = serde_json::json!({
                "service.name": self.resource.service_name(),
                "batch": batch.sequence,
                "trace_id": format!("{:032x}", span.trace_id),
                "span_id": format!("{:016x}", span.span_id),
                "parent_span_id": span.parent_span_id.map(|id| format!("{:016x}", id)),
                "name": span.name,
                "kind": span.kind,
                "start_time": span.start_time,
                "duration_ns": span.duration_nanos(),
                "status": span.status,
                "attributes": span.attributes,
            });
            serde_json::to_writer(&mut out, &line)
                .map_err(|e| ExportError::Serialization(e.to_string()))?;
            out.push(b'\n');
        }

        std::io::stdout()
            .lock()
            .write_all(&out)
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Exporter that discards all spans. Stands in for the collector when tracing
/// degrades to a no-op.
pub struct NullExporter;

impl NullExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SpanExporter for NullExporter {
    async fn export(&self, _batch: SpanBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Exporter that records every batch it receives.
///
/// Substituted for the collector in tests: it can simulate a slow backend
/// and a failing or stalled shutdown, and it rejects exports after shutdown like a real
/// transport would.
#[derive(Default)]
pub struct InMemoryExporter {
    batches: Mutex<Vec<SpanBatch>>,
    delay: Option<Duration>,
    fail_shutdown: bool,
    stall_shutdown: bool,
    is_shutdown: AtomicBool,
    export_calls: AtomicU64,
    shutdown_calls: AtomicU64,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every export sleeps for `delay` before recording the batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `shutdown` reports a transport error (after marking itself shut down).
    pub fn with_failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    /// `shutdown` never completes, like a collector that stops responding
    /// while the channel closes.
    pub fn with_stalled_shutdown(mut self) -> Self {
        self.stall_shutdown = true;
        self
    }

    /// Snapshot of all recorded batches, in the order they were exported.
    pub fn batches(&self) -> Vec<SpanBatch> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All recorded spans, flattened in export order.
    pub fn spans(&self) -> Vec<Span> {
        self.batches()
            .into_iter()
            .flat_map(|batch| batch.spans)
            .collect()
    }

    pub fn exported_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(SpanBatch::len)
            .sum()
    }

    pub fn batch_count(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of `export` invocations, successful or not.
    pub fn export_calls(&self) -> u64 {
        self.export_calls.load(Ordering::Relaxed)
    }

    pub fn shutdown_calls(&self) -> u64 {
        self.shutdown_calls.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        self.export_calls.fetch_add(1, Ordering::Relaxed);
        if self.is_shutdown() {
            return Err(ExportError::Shutdown);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(batch);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExportError> {
        self.shutdown_calls.fetch_add(1, Ordering::Relaxed);
        self.is_shutdown.store(true, Ordering::Release);
        if self.stall_shutdown {
            std::future::pending::<()>().await;
        }
        if self.fail_shutdown {
            return Err(ExportError::Transport("connection reset while closing".into()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;

    fn batch_of(sequence: u64, n: u64) -> SpanBatch {
        let spans = (1..=n)
            .map(|i| Span::new(u128::from(i), i, None, "test", SpanKind::Internal))
            .collect();
        SpanBatch::sealed(sequence, spans)
    }

    #[tokio::test]
    async fn test_stdout_exporter() {
        let exporter = StdoutExporter::new(Resource::new("test"));
        let result = exporter.export(batch_of(0, 2)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_null_exporter() {
        let exporter = NullExporter::new();
        let result = exporter.export(batch_of(0, 1000)).await;
        assert!(result.is_ok());
        assert!(exporter.shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_exporter_records_batches() {
        let exporter = InMemoryExporter::new();
        exporter.export(batch_of(0, 10)).await.unwrap();
        exporter.export(batch_of(1, 5)).await.unwrap();

        assert_eq!(exporter.exported_count(), 15);
        assert_eq!(exporter.batch_count(), 2);
        let sequences: Vec<u64> = exporter.batches().iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_in_memory_exporter_rejects_after_shutdown() {
        let exporter = InMemoryExporter::new().with_failing_shutdown();
        assert!(exporter.shutdown().await.is_err());
        assert!(matches!(
            exporter.export(batch_of(0, 1)).await,
            Err(ExportError::Shutdown)
        ));
        assert_eq!(exporter.exported_count(), 0);
        assert_eq!(exporter.export_calls(), 1);
        assert_eq!(exporter.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn test_boxed_dispatch() {
        let exporter: std::sync::Arc<dyn SpanExporterBoxed> =
            std::sync::Arc::new(InMemoryExporter::new());
        exporter.export_boxed(batch_of(0, 3)).await.unwrap();
        exporter.shutdown_boxed().await.unwrap();
        assert_eq!(exporter.name(), "in_memory");
    }
}
