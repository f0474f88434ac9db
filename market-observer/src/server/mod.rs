//! HTTP surface: websocket endpoint plus the small REST API.

pub mod client;
pub mod hub;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use observer_common::types::ProcessingMetrics;

pub use hub::Hub;

pub struct AppState {
    pub hub: Arc<Hub>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| o.starts_with("http://127.0.0.1:"))
                .unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .allow_credentials(true);

    Router::new()
        .route("/ws", get(client::ws_handler))
        .route("/api/metrics", get(get_metrics))
        .route("/api/config", get(get_config))
        .route("/api/health", get(get_health))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(host: &str, port: u16, state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(state)).await
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<ProcessingMetrics> {
    Json(state.hub.metrics())
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "timeframes": state.hub.timeframes() }))
}

async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.hub.connection_count(),
        "latest_update": state.hub.latest_timestamp(),
    }))
}
