//! HTTP surface: router, per-request server spans and header propagation.

use crate::storage::Ping;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use trace_pipeline::{
    CompositePropagator, Extractor, Injector, PropagationContext, SpanKind, SpanStatus, Tracer,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState<P> {
    pub tracer: Tracer,
    pub propagator: Arc<CompositePropagator>,
    pub storage: P,
}

/// Trace context of the server span for the current request.
///
/// Inserted into request extensions by [`trace_requests`]; handlers start
/// their spans under it.
#[derive(Debug, Clone)]
pub struct RequestContext(pub PropagationContext);

/// Reads propagation headers from an HTTP header map.
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }
}

/// Writes propagation headers into an HTTP header map.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            self.0.insert(name, value);
        }
    }
}

pub fn router<P: Ping>(state: AppState<P>) -> Router {
    Router::new()
        .route("/health", get(health::<P>))
        .fallback(not_found)
        .layer(ServiceBuilder::new().layer(middleware::from_fn_with_state(state.clone(), trace_requests::<P>)))
        .with_state(state)
}

/// Wraps every request in a server span joined to the caller's trace.
///
/// The span is named `METHOD route`, carries the standard HTTP attributes
/// and gets an error status for 5xx responses.
pub async fn trace_requests<P: Ping>(State(state): State<AppState<P>>, mut request: Request, next: Next) -> Response {
    let remote = state.propagator.extract(&HeaderExtractor(request.headers()));

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| path.clone(), |m| m.as_str().to_string());

    let mut span = state.tracer.start_with_parent(format!("{method} {route}"), &remote);
    span.set_kind(SpanKind::Server);
    span.set_attribute("http.request.method", method.as_str());
    span.set_attribute("url.path", path.as_str());
    span.set_attribute("http.route", route.as_str());

    request.extensions_mut().insert(RequestContext(span.context()));

    let response = next.run(request).await;
    let status = response.status();
    span.set_attribute("http.response.status_code", i64::from(status.as_u16()));
    if status.is_server_error() {
        span.set_status(SpanStatus::error(status.to_string()));
    }

    tracing::info!(
        trace_id = %format!("{:032x}", span.trace_id()),
        method = %method,
        route = %route,
        status = status.as_u16(),
        "request handled"
    );
    span.end();
    response
}

async fn health<P: Ping>(
    State(state): State<AppState<P>>,
    Extension(RequestContext(cx)): Extension<RequestContext>,
) -> impl IntoResponse {
    let mut span = state.tracer.start_with_parent("storage.ping", &cx);
    span.set_kind(SpanKind::Client);

    match state.storage.ping().await {
        Ok(()) => {
            span.end_with_status(SpanStatus::Ok);
            (StatusCode::OK, "ok")
        }
        Err(e) => {
            span.record_error(&e);
            span.end();
            tracing::error!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;
    use trace_pipeline::{init_tracer_with_exporter, AttributeValue, InMemoryExporter, TracePipeline, TracingConfig};

    #[derive(Clone, Default)]
    struct FakeStore {
        down: Arc<AtomicBool>,
    }

    impl Ping for FakeStore {
        async fn ping(&self) -> Result<(), StorageError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StorageError::Timeout {
                    addr: "db:5432".to_string(),
                    timeout: Duration::from_secs(1),
                })
            } else {
                Ok(())
            }
        }
    }

    fn app(store: FakeStore) -> (Router, TracePipeline, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        let pipeline = init_tracer_with_exporter(&TracingConfig::new("product-api"), exporter.clone());
        let state = AppState {
            tracer: pipeline.tracer(),
            propagator: pipeline.propagator(),
            storage: store,
        };
        (router(state), pipeline, exporter)
    }

    #[tokio::test]
    async fn test_health_joins_caller_trace() {
        let (app, pipeline, exporter) = app(FakeStore::default());

        let request = HttpRequest::builder()
            .uri("/health")
            .header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
            .header("baggage", "tenant=acme")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("traceparent").is_none());

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");

        pipeline.shutdown_handle().shutdown().await;
        let spans = exporter.spans();
        let server = spans.iter().find(|s| s.name == "GET /health").unwrap();
        let ping = spans.iter().find(|s| s.name == "storage.ping").unwrap();

        assert_eq!(server.trace_id, 0x0af7_6519_16cd_43dd_8448_eb21_1c80_319c);
        assert_eq!(server.parent_span_id, Some(0xb7ad_6b71_6920_3331));
        assert_eq!(server.kind, SpanKind::Server);
        assert_eq!(server.attributes.get("http.route"), Some(&AttributeValue::String("/health".into())));
        assert_eq!(server.attributes.get("http.response.status_code"), Some(&AttributeValue::Int(200)));
        assert_eq!(ping.trace_id, server.trace_id);
        assert_eq!(ping.parent_span_id, Some(server.span_id));
        assert_eq!(ping.status, SpanStatus::Ok);
    }

    #[tokio::test]
    async fn test_unhealthy_storage_returns_503() {
        let store = FakeStore::default();
        store.down.store(true, Ordering::SeqCst);
        let (app, pipeline, exporter) = app(store);

        let request = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        pipeline.shutdown_handle().shutdown().await;
        let spans = exporter.spans();
        let server = spans.iter().find(|s| s.name == "GET /health").unwrap();
        let ping = spans.iter().find(|s| s.name == "storage.ping").unwrap();
        assert!(server.status.is_error());
        assert!(ping.status.is_error());
        // No inbound trace: the server span starts a new one
        assert!(server.parent_span_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_route_is_traced_by_path() {
        let (app, pipeline, exporter) = app(FakeStore::default());

        let request = HttpRequest::builder().uri("/coffees").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        pipeline.shutdown_handle().shutdown().await;
        let spans = exporter.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "GET /coffees");
        assert!(!spans[0].status.is_error());
    }

    #[test]
    fn test_injector_skips_invalid_header_values() {
        let mut headers = HeaderMap::new();
        HeaderInjector(&mut headers).set("baggage", "a=1".to_string());
        HeaderInjector(&mut headers).set("traceparent", "bad\nvalue".to_string());
        assert_eq!(HeaderExtractor(&headers).get("baggage"), Some("a=1"));
        assert!(HeaderExtractor(&headers).get("traceparent").is_none());
    }
}
