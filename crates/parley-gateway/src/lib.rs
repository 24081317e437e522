//! Parley call gateway.
//!
//! Serves the call lifecycle REST API, pairs the two signaling WebSockets of
//! each call and runs the embedded STUN/TURN relay whose credentials are
//! derived from the callers' access tokens.

pub mod auth;
pub mod calls;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod relay;
pub mod security;
pub mod signal;

use std::sync::Arc;

use axum::{
    extract::{FromRef, State},
    http::{header, Method},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use credentials::CredentialIssuer;
pub use error::ApiError;
pub use signal::SignalingHub;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub hub: Arc<SignalingHub>,
    pub issuer: Arc<CredentialIssuer>,
}

impl AppState {
    pub fn new(pool: SqlitePool, issuer: CredentialIssuer) -> Self {
        Self {
            pool,
            hub: Arc::new(SignalingHub::new()),
            issuer: Arc::new(issuer),
        }
    }
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for Arc<SignalingHub> {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

impl FromRef<AppState> for Arc<CredentialIssuer> {
    fn from_ref(state: &AppState) -> Self {
        state.issuer.clone()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeMetrics {
    active_calls: usize,
    active_connections: usize,
}

async fn health(State(hub): State<Arc<SignalingHub>>) -> impl IntoResponse {
    Json(RuntimeMetrics {
        active_calls: hub.active_calls(),
        active_connections: hub.active_connections(),
    })
}

pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins = security::cors_origin_values(allowed_origins);
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/calls/start", post(calls::start_call))
        .route("/api/calls/status", get(calls::call_status))
        .route("/api/calls/config", get(calls::call_config))
        .route("/api/calls/signal", get(signal::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
