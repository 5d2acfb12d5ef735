//! passdesk lets help desk staff reset passwords and unlock the directory
//! accounts of the groups delegated to them.

#![forbid(unsafe_code)]
pub mod config;
pub mod delegation;
pub mod directory;
pub mod error;
mod router;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::get;
use axum::{Router, middleware as AxumMiddleware};
use metrics_exporter_prometheus::PrometheusHandle;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

pub use error::ServerError;

use delegation::Delegation;
use directory::{Directory, LdapDirectory};

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    credentials: Option<(&str, &str)>,
    body: String,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use base64::Engine;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");

    if let Some((username, password)) = credentials {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{password}"));
        request =
            request.header(header::AUTHORIZATION, format!("Basic {token}"));
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// State backed by an in-memory directory.
#[cfg(test)]
pub(crate) fn test_state(
    directory: directory::memory::MemoryDirectory,
) -> AppState {
    AppState::new(delegation::tests::config(), Arc::new(directory), None)
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub directory: Arc<dyn Directory>,
    pub delegation: Delegation,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: Arc<config::Configuration>,
        directory: Arc<dyn Directory>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            delegation: Delegation::new(
                Arc::clone(&config),
                Arc::clone(&directory),
            ),
            config,
            directory,
            metrics,
        }
    }
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(
                    |chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                        tracing::trace!(
                            size_bytes = chunk.len(),
                            latency = ?latency,
                            "sending body chunk"
                        )
                    },
                )
                .make_span_with(
                    DefaultMakeSpan::new()
                        .include_headers(true)
                        .level(tracing::Level::INFO),
                )
                .on_request(DefaultOnRequest::new())
                .on_response(
                    DefaultOnResponse::new()
                        .include_headers(true)
                        .latency_unit(LatencyUnit::Micros),
                ),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(10),
        ))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        // `GET /metrics` goes to `metrics`.
        .route("/metrics", get(router::status::metrics))
        .nest("/managed-users", router::users::router(state.clone()))
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
pub fn initialize_state(
    config: config::Configuration,
    metrics: Option<PrometheusHandle>,
) -> AppState {
    let directory = match config.ensure_directory() {
        Ok(settings) => LdapDirectory::new(settings.clone()),
        Err(err) => {
            tracing::warn!(
                %err,
                "directory is not configured, nobody can be managed"
            );
            LdapDirectory::default()
        },
    };

    AppState::new(Arc::new(config), Arc::new(directory), metrics)
}
