//! Outbound HTTP with trace propagation.
//!
//! Every request runs inside a client span parented to the caller's context,
//! and carries that span's `traceparent` and `baggage` headers so the
//! downstream service joins the same trace.

use crate::http::HeaderInjector;
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use trace_pipeline::{CompositePropagator, PropagationContext, SpanKind, SpanStatus, Tracer};
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url {0:?}: {1}")]
    InvalidUrl(String, #[source] url::ParseError),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// HTTP client for downstream services.
#[derive(Clone)]
pub struct TracedClient {
    client: Client,
    base_url: Url,
    tracer: Tracer,
    propagator: Arc<CompositePropagator>,
}

impl TracedClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tracer: Tracer,
        propagator: Arc<CompositePropagator>,
    ) -> Result<Self, ClientError> {
        let base_url = Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(base_url.to_string(), e))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ClientError::Request {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            base_url,
            tracer,
            propagator,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends `GET base_url/path` as part of the trace in `parent`.
    ///
    /// The client span gets an error status on transport failures and 5xx
    /// responses.
    pub async fn get(&self, path: &str, parent: &PropagationContext) -> Result<Response, ClientError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(path.to_string(), e))?;

        let mut span = self.tracer.start_with_parent(format!("GET {}", url.path()), parent);
        span.set_kind(SpanKind::Client);
        span.set_attribute("http.request.method", "GET");
        span.set_attribute("url.full", url.as_str());

        let mut headers = HeaderMap::new();
        self.propagator.inject(&span.context(), &mut HeaderInjector(&mut headers));

        match self.client.get(url.clone()).headers(headers).send().await {
            Ok(response) => {
                let status = response.status();
                span.set_attribute("http.response.status_code", i64::from(status.as_u16()));
                if status.is_server_error() {
                    span.set_status(SpanStatus::error(status.to_string()));
                }
                span.end();
                Ok(response)
            }
            Err(source) => {
                span.record_error(&source);
                span.end();
                tracing::error!(url = %url, error = %source, "downstream request failed");
                Err(ClientError::Request {
                    url: url.to_string(),
                    source,
                })
            }
        }
    }
}

impl std::fmt::Debug for TracedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}
