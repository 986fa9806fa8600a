use crate::batch_processor::BatchConfig;
use crate::error::PipelineError;
use crate::exporter::SpanExporterBoxed;
use crate::processor::{BatchSpanProcessor, PipelineMetrics};
use crate::resource::Resource;
use crate::tracer::Tracer;
use std::sync::Arc;
use std::time::Duration;

/// Owns the batching processor for one pipeline and hands out tracers.
///
/// This is an explicit, process-scoped handle rather than a global: bootstrap
/// creates it once, passes clones (or tracers) to components, and tears it
/// down once. Tests build their own with a fake exporter.
#[derive(Clone)]
pub struct TracerProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    resource: Resource,
    processor: BatchSpanProcessor,
    shutdown_timeout: Duration,
}

impl TracerProvider {
    /// Builds a provider exporting through `exporter`. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        resource: Resource,
        batch_config: BatchConfig,
        exporter: Arc<dyn SpanExporterBoxed>,
        shutdown_timeout: Duration,
    ) -> Self {
        let processor = BatchSpanProcessor::new(batch_config, exporter);
        Self {
            inner: Arc::new(ProviderInner {
                resource,
                processor,
                shutdown_timeout,
            }),
        }
    }

    /// A tracer delivering spans to this provider's processor.
    pub fn tracer(&self) -> Tracer {
        Tracer::new(self.inner.processor.sink())
    }

    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        self.inner.processor.metrics()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.processor.is_shutdown()
    }

    /// Exports every span ended so far, bounded by the shutdown timeout.
    pub async fn force_flush(&self) -> Result<(), PipelineError> {
        self.inner
            .processor
            .force_flush(self.inner.shutdown_timeout)
            .await
    }

    /// Drains and stops the processor, bounded by the shutdown timeout.
    ///
    /// Does not close the exporter; that is the second step of
    /// [`crate::ShutdownHandle::shutdown`].
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        self.inner
            .processor
            .shutdown(self.inner.shutdown_timeout)
            .await
    }
}

impl std::fmt::Debug for TracerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerProvider")
            .field("service", &self.inner.resource.service_name())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use crate::span::SpanStatus;

    fn provider(exporter: Arc<InMemoryExporter>) -> TracerProvider {
        TracerProvider::new(
            Resource::new("test"),
            BatchConfig::default(),
            exporter,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_nested_spans_are_exported_with_parent_links() {
        let exporter = Arc::new(InMemoryExporter::new());
        let provider = provider(exporter.clone());
        let tracer = provider.tracer();

        let root = tracer.start("request");
        {
            let mut child = root.child("db.query");
            child.set_attribute("db.statement", "SELECT 1");
            let grandchild = child.child("db.decode");
            grandchild.end();
            child.end_with_status(SpanStatus::Ok);
        }
        let root_id = root.span_id();
        root.end();

        provider.force_flush().await.unwrap();
        let spans = exporter.spans();
        assert_eq!(spans.len(), 3);

        // Children end first, so they are queued first
        assert_eq!(spans[0].name, "db.decode");
        assert_eq!(spans[1].name, "db.query");
        assert_eq!(spans[2].name, "request");
        assert_eq!(spans[0].parent_span_id, Some(spans[1].span_id));
        assert_eq!(spans[1].parent_span_id, Some(root_id));
        assert!(spans[2].is_root());
        assert!(spans.iter().all(|s| s.trace_id == spans[2].trace_id));
        assert!(spans.iter().all(|s| s.end_time >= s.start_time));

        // Children are contained in their parent's lifetime
        assert!(spans[1].start_time >= spans[2].start_time);
        assert!(spans[1].end_time <= spans[2].end_time);

        provider.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_span_still_ends() {
        let exporter = Arc::new(InMemoryExporter::new());
        let provider = provider(exporter.clone());

        {
            let _span = provider.tracer().start("implicit");
        }

        provider.shutdown().await.unwrap();
        assert_eq!(exporter.exported_count(), 1);
        assert!(provider.is_shutdown());
    }

    #[tokio::test]
    async fn test_unsampled_remote_parent_is_not_exported() {
        let exporter = Arc::new(InMemoryExporter::new());
        let provider = provider(exporter.clone());
        let cx = crate::propagation::PropagationContext {
            trace_id: 1,
            parent_span_id: Some(1),
            sampled: false,
            baggage: Default::default(),
        };

        let span = provider.tracer().start_with_parent("ignored", &cx);
        assert!(!span.is_recording());
        span.end();

        provider.shutdown().await.unwrap();
        assert_eq!(exporter.exported_count(), 0);
    }
}
