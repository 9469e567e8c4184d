//! HTTP endpoints for health checks and relay info.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use axum::{http::header, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// Start an HTTP server exposing `/healthz` and the relay info document.
pub async fn serve_http(
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let app = Router::new()
        .route("/", get(relay_info))
        .route("/healthz", get(healthz));
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

#[derive(Serialize, Deserialize)]
struct RelayInfo {
    name: String,
    description: String,
    software: String,
    version: String,
    supported_nips: Vec<u32>,
}

/// NIP-11 relay information document.
async fn relay_info() -> impl axum::response::IntoResponse {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(RelayInfo {
            name: "castr".into(),
            description: "in-memory nostr relay".into(),
            software: "castr".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            supported_nips: vec![1, 11, 16, 20, 33, 45],
        }),
    )
}
