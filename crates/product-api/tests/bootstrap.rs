use clap::Parser;
use product_api::{run, run_with, BootError, Config, Ping, StorageError};
use readiness::{CancellationToken, Connector, ReadinessError, ATTEMPT_SPAN_NAME};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trace_pipeline::{init_tracer_with_exporter, InMemoryExporter, SpanStatus, TracePipeline, TracingConfig};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Debug, Clone)]
struct FakeConnection;

impl Ping for FakeConnection {
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Fails until `succeed_on` attempts have been made.
struct ScriptedConnector {
    calls: Arc<AtomicU32>,
    succeed_on: Option<u32>,
}

impl ScriptedConnector {
    fn succeeding_on(attempt: u32) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            succeed_on: Some(attempt),
        }
    }

    fn never() -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            succeed_on: None,
        }
    }
}

impl Connector for ScriptedConnector {
    type Connection = FakeConnection;
    type Error = StorageError;

    async fn connect(&self, _dsn: &str) -> Result<FakeConnection, StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.succeed_on {
            Some(n) if call >= n => Ok(FakeConnection),
            _ => Err(StorageError::Unreachable {
                addr: "db:5432".to_string(),
                source: std::io::ErrorKind::ConnectionRefused.into(),
            }),
        }
    }
}

/// Counts ERROR events from this crate emitted while installed.
#[derive(Clone, Default)]
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: tracing::Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() == tracing::Level::ERROR && meta.target().starts_with("product_api") {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn config(max_wait_secs: &str) -> Config {
    Config::try_parse_from([
        "product-api",
        "--bind-address",
        "127.0.0.1:0",
        "--max-startup-wait-secs",
        max_wait_secs,
        "--retry-interval-ms",
        "1000",
        "--backoff",
        "fixed",
    ])
    .unwrap()
}

fn pipeline() -> (TracePipeline, Arc<InMemoryExporter>) {
    product_api::logging::init_test_logging();
    let exporter = Arc::new(InMemoryExporter::new());
    let pipeline = init_tracer_with_exporter(&TracingConfig::new("product-api"), exporter.clone());
    (pipeline, exporter)
}

#[tokio::test(start_paused = true)]
async fn test_deadline_exits_4_and_exports_init_span() {
    let (pipeline, exporter) = pipeline();
    let connector = ScriptedConnector::never();
    let calls = connector.calls.clone();

    let err = run_with(&config("3"), &pipeline, connector, CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 4);
    assert!(matches!(
        err,
        BootError::NotReady(ReadinessError::DeadlineExceeded { attempts: 3, .. })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The failed startup is flushed before returning
    assert!(pipeline.shutdown_handle().is_shutdown());
    assert_eq!(exporter.shutdown_calls(), 1);

    let spans = exporter.spans();
    let init = spans.iter().find(|s| s.name == "init").unwrap();
    assert!(init.status.is_error());
    let attempts: Vec<_> = spans.iter().filter(|s| s.name == ATTEMPT_SPAN_NAME).collect();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|s| s.parent_span_id == Some(init.span_id)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_ready_exits_5() {
    let (pipeline, exporter) = pipeline();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = run_with(&config("60"), &pipeline, ScriptedConnector::never(), cancel)
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 5);
    assert_eq!(exporter.shutdown_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ready_then_cancel_shuts_down_cleanly() {
    let (pipeline, exporter) = pipeline();
    let config = config("60");
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();

    let (result, ()) = tokio::join!(
        run_with(&config, &pipeline, ScriptedConnector::succeeding_on(2), cancel),
        async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        }
    );

    assert!(result.is_ok(), "{result:?}");
    assert_eq!(exporter.shutdown_calls(), 1);

    let spans = exporter.spans();
    let init = spans.iter().find(|s| s.name == "init").unwrap();
    assert_eq!(init.status, SpanStatus::Ok);
    let attempts: Vec<_> = spans.iter().filter(|s| s.name == ATTEMPT_SPAN_NAME).collect();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].status.is_error() || attempts[1].status.is_error());
}

#[tokio::test]
async fn test_exporter_init_failure_is_logged_and_exits_3() {
    let errors = ErrorCounter::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(errors.clone()));

    let config = Config::try_parse_from([
        "product-api",
        "--trace-exporter",
        "otlp",
        "--collector-endpoint",
        "localhost:4317 nope",
    ])
    .unwrap();

    let err = run(config, CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, BootError::ExporterInit(_)), "{err}");
    assert_eq!(err.exit_code(), 3);
    assert!(errors.0.load(Ordering::SeqCst) >= 1, "exporter init failure was not logged");
}
