//! Configuration parsing for the product API.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides
//! - An optional JSON config file (`CONFIG_FILE`) whose `db_connection` and
//!   `bind_address` take precedence over flags and environment

use anyhow::Context;
use clap::{Parser, ValueEnum};
use readiness::{Backoff, ExponentialBackoff, FixedInterval, ReadinessConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use trace_pipeline::{BatchConfig, ExporterKind, TracingConfig};

pub const DEFAULT_DB_CONNECTION: &str =
    "host=localhost port=5432 user=postgres password=password dbname=products sslmode=disable";

/// Retry pacing while waiting for the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackoffKind {
    /// Retry every `retry-interval-ms`
    Fixed,
    /// Start at `retry-interval-ms` and double, with jitter
    Exponential,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    Pretty,
}

/// Product API: coffee catalogue service.
#[derive(Parser, Debug, Clone)]
#[command(name = "product-api")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Database connection string (key=value pairs or a postgres:// URL)
    #[arg(long, env = "DB_CONNECTION", default_value = DEFAULT_DB_CONNECTION)]
    pub db_connection: String,

    /// Address the HTTP server binds to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0:9090")]
    pub bind_address: String,

    /// JSON file overriding `db_connection` and `bind_address`
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// OTLP/gRPC collector endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT", default_value = "http://localhost:4317")]
    pub collector_endpoint: String,

    /// Where spans go: otlp, stdout or none
    #[arg(long, env = "TRACE_EXPORTER", default_value = "otlp")]
    pub trace_exporter: ExporterKind,

    /// Logical service name reported with every span
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "product-api")]
    pub service_name: String,

    /// Give up waiting for the database after this many seconds
    #[arg(long, env = "MAX_STARTUP_WAIT_SECS", default_value_t = 60)]
    pub max_startup_wait_secs: u64,

    /// Delay between database connection attempts
    #[arg(long, env = "RETRY_INTERVAL_MS", default_value_t = 1000)]
    pub retry_interval_ms: u64,

    /// Retry pacing strategy
    #[arg(long, env = "STARTUP_BACKOFF", value_enum, default_value_t = BackoffKind::Fixed)]
    pub backoff: BackoffKind,

    /// Budget for a single database connection attempt
    #[arg(long, env = "DB_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub db_connect_timeout_ms: u64,

    /// Maximum spans per exported batch
    #[arg(long, env = "OTEL_BSP_MAX_EXPORT_BATCH_SIZE", default_value_t = 512)]
    pub batch_size: usize,

    /// Maximum age of a batch before it is exported
    #[arg(long, env = "OTEL_BSP_SCHEDULE_DELAY", default_value_t = 5000)]
    pub batch_delay_ms: u64,

    /// Spans buffered ahead of the exporter before new ones are dropped
    #[arg(long, env = "OTEL_BSP_MAX_QUEUE_SIZE", default_value_t = 2048)]
    pub max_queue_size: usize,

    /// Upper bound on a single export call
    #[arg(long, env = "OTEL_BSP_EXPORT_TIMEOUT", default_value_t = 30000)]
    pub export_timeout_ms: u64,

    /// Upper bound on draining spans at shutdown
    #[arg(long, env = "OTEL_BSP_SHUTDOWN_TIMEOUT", default_value_t = 5000)]
    pub shutdown_timeout_ms: u64,

    /// Keep running with tracing disabled if the exporter cannot be built
    #[arg(long, env = "TRACE_FALLBACK_NOOP")]
    pub trace_fallback_noop: bool,

    /// Fail startup if the collector is unreachable
    #[arg(long, env = "OTEL_CONNECT_EAGERLY")]
    pub collector_connect_eagerly: bool,

    /// Log filter (trace, debug, info, warn, error or a full directive)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Keys read from the JSON config file. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    db_connection: Option<String>,
    bind_address: Option<String>,
}

impl Config {
    /// Parses arguments and environment, then applies the config file.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::try_parse()?;
        if let Some(path) = config.config_file.clone() {
            config.apply_file(&path)?;
        }
        Ok(config)
    }

    /// Overrides settings with the values present in a JSON config file.
    pub fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let file: FileConfig = serde_json::from_str(&raw)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;

        if let Some(db) = file.db_connection {
            self.db_connection = db;
        }
        if let Some(bind) = file.bind_address {
            self.bind_address = bind;
        }
        Ok(())
    }

    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            service_name: self.service_name.clone(),
            service_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            exporter: self.trace_exporter,
            collector_endpoint: self.collector_endpoint.clone(),
            batch: BatchConfig::default()
                .with_max_export_batch_size(self.batch_size)
                .with_scheduled_delay(Duration::from_millis(self.batch_delay_ms))
                .with_max_queue_size(self.max_queue_size)
                .with_export_timeout(Duration::from_millis(self.export_timeout_ms)),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            fallback_to_noop: self.trace_fallback_noop,
            connect_eagerly: self.collector_connect_eagerly,
        }
    }

    pub fn readiness_config(&self) -> ReadinessConfig {
        ReadinessConfig {
            max_wait: Duration::from_secs(self.max_startup_wait_secs),
            retry_interval: self.retry_interval(),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.db_connect_timeout_ms)
    }

    /// The retry pacing selected by `--backoff`.
    pub fn backoff(&self) -> Box<dyn Backoff> {
        match self.backoff {
            BackoffKind::Fixed => Box::new(FixedInterval::new(self.retry_interval())),
            BackoffKind::Exponential => Box::new(ExponentialBackoff::new(
                self.retry_interval(),
                self.retry_interval().saturating_mul(16),
            )),
        }
    }
}
