//! Network ingress for atomd.
//!
//! One HTTP listener carries config management, atom ingress (protobuf or
//! JSON) and report queries.

pub mod http;
pub mod proto;

pub use http::{create_router, IngestResponse};

use crate::core::config::ServerConfig;
use crate::core::{AtomdError, Result};
use crate::engine::StatsEngine;
use std::net::SocketAddr;
use std::sync::Arc;

/// Binds the HTTP listener and serves until the task is dropped or the
/// listener fails.
pub async fn serve(engine: Arc<StatsEngine>, config: &ServerConfig) -> Result<()> {
    let addr = SocketAddr::new(config.bind_address, config.http_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AtomdError::network(format!("Failed to bind {}: {}", addr, e)))?;
    tracing::info!("atomd HTTP API listening on {}", addr);

    let router = create_router(engine, config.request_timeout);
    axum::serve(listener, router)
        .await
        .map_err(|e| AtomdError::network(format!("HTTP server failed: {}", e)))
}
