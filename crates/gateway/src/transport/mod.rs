// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gateway frontend: WebSocket endpoint, health surface, router assembly.

pub mod auth;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{any, get};
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::manager::SessionManager;
use crate::persist::PersistHandle;

pub use auth::{StaticTokenValidator, TokenValidator};

/// Shared state behind every connection handler.
pub struct GatewayState {
    pub manager: Arc<SessionManager>,
    pub validator: Arc<dyn TokenValidator>,
    pub writer: PersistHandle,
    pub heartbeat: Duration,
    pub subscriber_queue: usize,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

impl GatewayState {
    pub fn new(
        config: &Config,
        manager: Arc<SessionManager>,
        validator: Arc<dyn TokenValidator>,
        writer: PersistHandle,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            validator,
            writer,
            heartbeat: config.heartbeat(),
            subscriber_queue: config.subscriber_queue,
            started_at: Instant::now(),
            shutdown,
        })
    }
}

/// Health payload for load balancers and dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub status: String,
    pub gateway_id: String,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub writer_paused: bool,
}

async fn health(
    axum::extract::State(state): axum::extract::State<Arc<GatewayState>>,
) -> axum::Json<HealthInfo> {
    axum::Json(HealthInfo {
        status: if state.writer.is_paused() { "degraded" } else { "ok" }.to_owned(),
        gateway_id: state.manager.gateway_id().to_owned(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        sessions: state.manager.session_count(),
        writer_paused: state.writer.is_paused(),
    })
}

/// Assemble the gateway router.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", any(ws::ws_handler))
        .route("/api/v1/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
