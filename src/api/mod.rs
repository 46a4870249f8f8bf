pub mod error;
mod handlers;
pub mod origin;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::shutdown::ShutdownCoordinator;

use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub shutdown: ShutdownCoordinator,
    /// Source of per-socket ids, used to tag devtools changes.
    pub next_conn_id: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, shutdown: ShutdownCoordinator) -> Self {
        Self {
            dispatcher,
            shutdown,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Origins allowed by CORS and by the WebSocket origin check.
///
/// Use `RouterConfig::default()` in tests.
pub struct RouterConfig {
    pub allowed_origins: Vec<String>,
}

impl RouterConfig {
    /// Allow local pages on the given ports.
    pub fn local(ports: &[u16]) -> Self {
        Self {
            allowed_origins: origin::local_origins(ports),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::local(&[])
    }
}

/// The HTTP API.
pub fn router(state: AppState, config: &RouterConfig) -> Router {
    let api = Router::new()
        .route("/instances", get(instances))
        .route("/commands", get(commands_list))
        .route("/commands/execute", post(commands_execute))
        .route("/devtools/toggle", post(devtools_toggle))
        .route("/devtools/execute", post(devtools_execute));

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .layer(TraceLayer::new_for_http())
}

/// The WebSocket endpoint. Clients may connect at `/` or `/ws`.
pub fn ws_router(state: AppState, config: &RouterConfig) -> Router {
    let allowed: Arc<[String]> = config.allowed_origins.clone().into();
    Router::new()
        .route("/", get(ws::ws_upgrade))
        .route("/ws", get(ws::ws_upgrade))
        .with_state(state)
        .layer(axum::middleware::from_fn(move |req, next| {
            let origins = allowed.clone();
            origin::check_ws_origin(origins, req, next)
        }))
}
