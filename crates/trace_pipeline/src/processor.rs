//! Batching span processor: the asynchronous bridge between span producers and
//! the exporter.
//!
//! Producers hand ended spans to a [`SpanSink`], which does a non-blocking
//! `try_send` into a bounded queue. A single background worker task owns the
//! receiving end, feeds spans into a [`BatchProcessor`], and exports each sealed
//! batch. Because there is exactly one worker and it exports sequentially,
//! batches reach the exporter in the order they were sealed, and each batch is
//! handed over at most once (a failed export is counted, never retried).
//!
//! ```text
//!   ActiveSpan::end ──try_send──▶ [ bounded queue ] ──▶ worker ──▶ BatchProcessor
//!                                                         │            │ sealed
//!   force_flush / shutdown ──▶ [ control channel ] ───────┘            ▼
//!                                                               exporter.export()
//! ```

use crate::batch_processor::{BatchConfig, BatchProcessor};
use crate::error::{ExportError, PipelineError};
use crate::exporter::SpanExporterBoxed;
use crate::invariants::debug_assert_export_in_order;
use crate::span::{Span, SpanBatch};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Thread-safe pipeline counters.
///
/// All counters use `Ordering::Relaxed`: they are statistics, nothing
/// synchronizes on them.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Spans accepted into the queue
    pub spans_queued: AtomicU64,
    /// Spans rejected because the queue was full or the pipeline shut down
    pub spans_dropped: AtomicU64,
    /// Spans in successfully exported batches
    pub spans_exported: AtomicU64,
    /// Successfully exported batches
    pub batches_exported: AtomicU64,
    /// Spans in batches whose export failed or timed out
    pub spans_failed: AtomicU64,
    /// Failed or timed-out export calls
    pub export_errors: AtomicU64,
}

impl PipelineMetrics {
    pub fn spans_queued(&self) -> u64 {
        self.spans_queued.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn spans_failed(&self) -> u64 {
        self.spans_failed.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    /// Queued spans that have neither been exported nor failed yet.
    pub fn spans_in_flight(&self) -> u64 {
        self.spans_queued()
            .saturating_sub(self.spans_exported())
            .saturating_sub(self.spans_failed())
    }

    fn record_success(&self, span_count: u64) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, span_count: u64) {
        self.spans_failed.fetch_add(span_count, Ordering::Relaxed);
        self.export_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Producer-side handle of the span queue. Cheap to clone; never blocks.
#[derive(Clone)]
pub struct SpanSink {
    tx: mpsc::Sender<Span>,
    closed: Arc<AtomicBool>,
    metrics: Arc<PipelineMetrics>,
}

impl SpanSink {
    /// Queues an ended span for batching.
    ///
    /// Returns `false` if the span was dropped: the queue is full or the
    /// pipeline has shut down.
    pub fn submit(&self, span: Span) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.tx.try_send(span) {
            Ok(()) => {
                self.metrics.spans_queued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

enum Control {
    Flush(oneshot::Sender<Result<(), ExportError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Buffers ended spans and exports them in batches from a background task.
pub struct BatchSpanProcessor {
    sink: SpanSink,
    control_tx: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<PipelineMetrics>,
}

impl BatchSpanProcessor {
    /// Creates the processor and spawns its export worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BatchConfig, exporter: Arc<dyn SpanExporterBoxed>) -> Self {
        let metrics = Arc::new(PipelineMetrics::default());
        let (tx, spans_rx) = mpsc::channel(config.max_queue_size.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(
            config,
            exporter,
            spans_rx,
            control_rx,
            Arc::clone(&metrics),
        ));

        Self {
            sink: SpanSink {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
                metrics: Arc::clone(&metrics),
            },
            control_tx,
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    /// Queues an ended span. Never blocks on the network.
    pub fn on_end(&self, span: Span) -> bool {
        self.sink.submit(span)
    }

    /// A producer handle that can outlive borrows of the processor.
    pub fn sink(&self) -> SpanSink {
        self.sink.clone()
    }

    /// Returns pipeline metrics
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.sink.closed.load(Ordering::Acquire)
    }

    /// Seals and exports everything queued so far, waiting up to `timeout`.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), PipelineError> {
        if self.is_shutdown() {
            return Err(PipelineError::AlreadyShutdown);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Flush(ack_tx))
            .map_err(|_| PipelineError::WorkerGone)?;

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result.map_err(PipelineError::from),
            Ok(Err(_)) => Err(PipelineError::WorkerGone),
            Err(_) => Err(PipelineError::FlushTimedOut(timeout)),
        }
    }

    /// Stops accepting spans, drains the queue and exports what remains.
    ///
    /// Bounded by `timeout`: if the exporter cannot keep up, the worker is
    /// aborted and the unexported spans are dropped. Only the first call does
    /// anything; later calls return [`PipelineError::AlreadyShutdown`].
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), PipelineError> {
        if self.sink.closed.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::AlreadyShutdown);
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(Control::Shutdown(ack_tx)).is_err() {
            return Err(PipelineError::WorkerGone);
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => {
                if let Some(worker) = worker {
                    let _ = worker.await;
                }
                Ok(())
            }
            Ok(Err(_)) => Err(PipelineError::WorkerGone),
            Err(_) => {
                if let Some(worker) = worker {
                    worker.abort();
                }
                let dropped_spans = self.metrics.spans_in_flight();
                self.metrics
                    .spans_dropped
                    .fetch_add(dropped_spans, Ordering::Relaxed);
                Err(PipelineError::ShutdownTimedOut {
                    timeout,
                    dropped_spans,
                })
            }
        }
    }
}

/// Tracks what the worker has handed to the exporter.
struct ExportState {
    exporter: Arc<dyn SpanExporterBoxed>,
    export_timeout: Duration,
    metrics: Arc<PipelineMetrics>,
    last_sequence: Option<u64>,
}

impl ExportState {
    async fn export(&mut self, batch: SpanBatch) -> Result<(), ExportError> {
        debug_assert_export_in_order!(self.last_sequence, batch.sequence);
        self.last_sequence = Some(batch.sequence);

        let sequence = batch.sequence;
        let span_count = batch.len() as u64;

        let result =
            match tokio::time::timeout(self.export_timeout, self.exporter.export_boxed(batch)).await {
                Ok(result) => result,
                Err(_) => Err(ExportError::Timeout(self.export_timeout)),
            };

        match result {
            Ok(()) => {
                self.metrics.record_success(span_count);
                tracing::debug!(
                    exporter = self.exporter.name(),
                    batch = sequence,
                    spans = span_count,
                    "exported span batch"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_error(span_count);
                tracing::error!(
                    exporter = self.exporter.name(),
                    batch = sequence,
                    spans = span_count,
                    error = %e,
                    "span batch export failed"
                );
                Err(e)
            }
        }
    }

    /// Exports `batch` if present, keeping the first error in `first_error`.
    async fn export_keep_first_error(
        &mut self,
        batch: Option<SpanBatch>,
        first_error: &mut Option<ExportError>,
    ) {
        if let Some(batch) = batch {
            if let Err(e) = self.export(batch).await {
                first_error.get_or_insert(e);
            }
        }
    }
}

async fn run_worker(
    config: BatchConfig,
    exporter: Arc<dyn SpanExporterBoxed>,
    mut spans_rx: mpsc::Receiver<Span>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    metrics: Arc<PipelineMetrics>,
) {
    let mut state = ExportState {
        exporter,
        export_timeout: config.export_timeout,
        metrics,
        last_sequence: None,
    };
    let mut batcher = BatchProcessor::new(config);

    loop {
        let deadline = batcher.deadline();
        // Placeholder when no batch is open; the branch is disabled anyway
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            biased;

            Some(control) = control_rx.recv() => match control {
                Control::Flush(ack) => {
                    let mut first_error = None;
                    // Everything queued before the flush request belongs to this flush
                    while let Ok(span) = spans_rx.try_recv() {
                        let sealed = batcher.add(span);
                        state.export_keep_first_error(sealed, &mut first_error).await;
                    }
                    let last = batcher.take_batch();
                    state.export_keep_first_error(last, &mut first_error).await;
                    let _ = ack.send(first_error.map_or(Ok(()), Err));
                }
                Control::Shutdown(ack) => {
                    // Refuse new spans; buffered ones are still delivered
                    spans_rx.close();
                    let mut first_error = None;
                    while let Some(span) = spans_rx.recv().await {
                        let sealed = batcher.add(span);
                        state.export_keep_first_error(sealed, &mut first_error).await;
                    }
                    let last = batcher.take_batch();
                    state.export_keep_first_error(last, &mut first_error).await;
                    if let Some(e) = first_error {
                        tracing::warn!(error = %e, "spans lost while draining for shutdown");
                    }
                    let _ = ack.send(());
                    break;
                }
            },

            maybe_span = spans_rx.recv() => match maybe_span {
                Some(span) => {
                    if let Some(batch) = batcher.add(span) {
                        let _ = state.export(batch).await;
                    }
                }
                None => {
                    // Every producer handle is gone
                    if let Some(batch) = batcher.take_batch() {
                        let _ = state.export(batch).await;
                    }
                    break;
                }
            },

            () = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                if let Some(batch) = batcher.take_batch() {
                    let _ = state.export(batch).await;
                }
            }
        }
    }

    tracing::debug!(
        batches = batcher.sealed_batches(),
        spans = batcher.metrics().spans_added,
        "span export worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;
    use crate::span::SpanKind;

    fn span(i: u64) -> Span {
        let mut span = Span::new(1, i, None, format!("op-{}", i), SpanKind::Internal);
        span.finish(crate::span::SpanStatus::Ok);
        span
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_full_batch_waits_for_delay() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = BatchConfig::default()
            .with_max_export_batch_size(100)
            .with_scheduled_delay(Duration::from_secs(5));
        let processor = BatchSpanProcessor::new(config, exporter.clone());

        for i in 0..50 {
            assert!(processor.on_end(span(i)));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert_eq!(exporter.exported_count(), 0, "no export before the delay elapses");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(exporter.exported_count(), 50);
        assert_eq!(exporter.batch_count(), 1);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_exports_without_waiting() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = BatchConfig::default()
            .with_max_export_batch_size(100)
            .with_scheduled_delay(Duration::from_secs(5));
        let processor = BatchSpanProcessor::new(config, exporter.clone());

        for i in 0..100 {
            processor.on_end(span(i));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(exporter.exported_count(), 100);
        assert_eq!(exporter.batch_count(), 1);
        assert_eq!(processor.metrics().batches_exported(), 1);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_force_flush_exports_open_batch() {
        let exporter = Arc::new(InMemoryExporter::new());
        let processor = BatchSpanProcessor::new(BatchConfig::default(), exporter.clone());

        for i in 0..7 {
            processor.on_end(span(i));
        }
        processor.force_flush(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exporter.exported_count(), 7);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exporter.batch_count(), 1, "nothing left for shutdown to export");
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = BatchConfig::default().with_max_queue_size(4);
        let processor = BatchSpanProcessor::new(config, exporter.clone());

        // The worker has not run yet on this single-threaded runtime
        let accepted = (0..10).filter(|i| processor.on_end(span(*i))).count();
        assert_eq!(accepted, 4);
        assert_eq!(processor.metrics().spans_dropped(), 6);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(exporter.exported_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_bounded_by_timeout() {
        let exporter = Arc::new(InMemoryExporter::new().with_delay(Duration::from_secs(60)));
        let processor = BatchSpanProcessor::new(BatchConfig::default(), exporter.clone());

        for i in 0..3 {
            processor.on_end(span(i));
        }

        let started = Instant::now();
        let result = processor.shutdown(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        match result {
            Err(PipelineError::ShutdownTimedOut { dropped_spans, .. }) => assert_eq!(dropped_spans, 3),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(exporter.exported_count(), 0);
    }

    #[tokio::test]
    async fn test_second_shutdown_is_benign() {
        let exporter = Arc::new(InMemoryExporter::new());
        let processor = BatchSpanProcessor::new(BatchConfig::default(), exporter.clone());
        processor.on_end(span(1));

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        let second = processor.shutdown(Duration::from_secs(1)).await.unwrap_err();
        assert!(second.is_benign());

        // Spans ended after shutdown are dropped, never exported
        assert!(!processor.on_end(span(2)));
        assert_eq!(exporter.exported_count(), 1);
        assert_eq!(exporter.export_calls(), 1);
    }
}
