//! Process startup and teardown.
//!
//! Startup order: tracing pipeline, then the `init` span, then the readiness
//! gate on the database, then the HTTP listener. Whatever happens after the
//! pipeline exists, it is shut down exactly once before `run` returns, so the
//! spans describing a failed startup still reach the collector.

use crate::config::Config;
use crate::http::{router, AppState};
use crate::logging::LoggingError;
use crate::storage::{Dsn, Ping, TcpConnector};
use readiness::{Connector, ReadinessError, ReadinessGate};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use trace_pipeline::{init_tracer, PipelineError, ShutdownOutcome, SpanStatus, TracePipeline};

#[derive(Debug, Error)]
pub enum BootError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),

    #[error("unable to initialise logging: {0}")]
    Logging(#[source] LoggingError),

    #[error(transparent)]
    ExporterInit(PipelineError),

    #[error("database not ready: {0}")]
    NotReady(#[source] ReadinessError),

    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

impl BootError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Logging(_) => 2,
            Self::ExporterInit(_) => 3,
            Self::NotReady(e) if e.is_cancelled() => 5,
            Self::NotReady(_) => 4,
            Self::Bind { .. } | Self::Serve(_) => 1,
        }
    }
}

/// Cancels `cancel` on SIGINT or SIGTERM.
pub fn shutdown_on_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unable to install SIGTERM handler");
                    if let Err(e) = ctrl_c.await {
                        tracing::error!(error = %e, "unable to listen for SIGINT");
                        return;
                    }
                    tracing::info!("received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = ctrl_c.await {
                tracing::error!(error = %e, "unable to listen for ctrl-c");
                return;
            }
            tracing::info!("received ctrl-c, shutting down");
        }

        cancel.cancel();
    });
}

/// Builds the tracing pipeline from `config` and runs the service against the
/// database over TCP until `cancel` fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), BootError> {
    let pipeline = match init_tracer(&config.tracing_config()).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            let err = BootError::ExporterInit(e);
            tracing::error!(error = %err, exit_code = err.exit_code(), "error initialising tracer");
            return Err(err);
        }
    };
    tracing::info!(exporter = pipeline.exporter_name(), "tracing initialised");

    let connector = TcpConnector::new(config.db_connect_timeout());
    run_with(&config, &pipeline, connector, cancel).await
}

/// Runs the service on an existing pipeline, then shuts the pipeline down.
pub async fn run_with<C>(
    config: &Config,
    pipeline: &TracePipeline,
    connector: C,
    cancel: CancellationToken,
) -> Result<(), BootError>
where
    C: Connector,
    C::Connection: Ping,
{
    let result = serve(config, pipeline, connector, &cancel).await;

    match pipeline.shutdown_handle().shutdown().await {
        ShutdownOutcome::CompletedWithErrors(n) => {
            tracing::warn!(failed_steps = n, "tracing shut down with errors");
        }
        ShutdownOutcome::Completed | ShutdownOutcome::AlreadyShutdown => {}
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, exit_code = e.exit_code(), "product-api exiting");
    }
    result
}

async fn serve<C>(
    config: &Config,
    pipeline: &TracePipeline,
    connector: C,
    cancel: &CancellationToken,
) -> Result<(), BootError>
where
    C: Connector,
    C::Connection: Ping,
{
    let tracer = pipeline.tracer();
    let mut init = tracer.start("init");
    init.set_attribute("server.address", config.bind_address.as_str());

    let database = redacted(&config.db_connection);
    tracing::info!(database = %database, "waiting for database");

    let gate = ReadinessGate::new(connector, config.readiness_config()).with_backoff(config.backoff());
    let acquired = gate.acquire(&config.db_connection, cancel, Some(&init)).await;
    let storage = match acquired {
        Ok(connection) => connection,
        Err(e) => {
            init.record_error(&e);
            init.end();
            return Err(BootError::NotReady(e));
        }
    };

    let listener = match TcpListener::bind(&config.bind_address).await {
        Ok(listener) => listener,
        Err(source) => {
            init.record_error(&source);
            init.end();
            return Err(BootError::Bind {
                addr: config.bind_address.clone(),
                source,
            });
        }
    };
    init.end_with_status(SpanStatus::Ok);

    let local = listener
        .local_addr()
        .map_or_else(|_| config.bind_address.clone(), |a| a.to_string());
    tracing::info!(address = %local, database = %database, "product-api listening");

    let app = router(AppState {
        tracer,
        propagator: pipeline.propagator(),
        storage,
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .map_err(BootError::Serve)?;

    tracing::info!("product-api stopped");
    Ok(())
}

fn redacted(dsn: &str) -> String {
    Dsn::parse(dsn).map_or_else(|_| "<invalid>".to_string(), |d| d.to_string())
}
