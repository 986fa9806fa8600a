//! Product API service shell.
//!
//! Waits for the database behind a readiness gate, serves HTTP with one
//! server span per request, propagates trace context on outbound calls, and
//! exports spans through the trace pipeline.
//! Catalogue handlers plug into [`http::router`].

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod http;
pub mod logging;
pub mod storage;

pub use bootstrap::{run, run_with, shutdown_on_signal, BootError};
pub use client::{ClientError, TracedClient};
pub use config::Config;
pub use storage::{Dsn, Ping, StorageConnection, StorageError, TcpConnector};
