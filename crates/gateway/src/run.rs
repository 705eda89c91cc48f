// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level gateway runner — shared by `main` and the spec suite.
//!
//! Construction order: store → persistence writer → session manager →
//! cleanup scheduler → listener. Teardown order is the reverse-ish
//! contract the components expect: cleanup stops, the manager drains its
//! actors (which flushes their events), then the writer performs its final
//! flush.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentConnector, TcpConnector};
use crate::cleanup::{CleanupConfig, CleanupScheduler};
use crate::config::Config;
use crate::manager::SessionManager;
use crate::persist::{self, WriterConfig};
use crate::store::{EventStore, MemoryStore, SessionStore};
use crate::transport::{build_router, GatewayState, StaticTokenValidator, TokenValidator};

/// Externally-supplied collaborators. The binary wires defaults; tests and
/// real deployments inject their own.
pub struct Deps {
    pub session_store: Arc<dyn SessionStore>,
    pub event_store: Arc<dyn EventStore>,
    pub validator: Arc<dyn TokenValidator>,
    pub connector: Arc<dyn AgentConnector>,
}

impl Deps {
    /// In-memory store, shared-token auth, TCP agent connector.
    pub fn for_binary(config: &Config) -> anyhow::Result<Self> {
        let endpoint = config
            .agent_endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--agent-endpoint must be specified"))?;
        let store = MemoryStore::new();
        Ok(Self {
            session_store: store.clone(),
            event_store: store,
            validator: Arc::new(StaticTokenValidator::new(config.auth_token.clone(), "default")),
            connector: Arc::new(TcpConnector::new(endpoint)),
        })
    }
}

/// A fully-prepared gateway ready to serve.
pub struct Gateway {
    pub state: Arc<GatewayState>,
    pub manager: Arc<SessionManager>,
    pub shutdown: CancellationToken,
    listener: TcpListener,
    router: axum::Router,
    writer_cancel: CancellationToken,
    writer_task: JoinHandle<()>,
    renewal_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
}

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::fmt;

    // Priority: --log-level / PERCH_LOG_LEVEL > RUST_LOG > default ("info").
    let filter = if std::env::var("PERCH_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Construct every component and bind the listener.
pub async fn prepare(config: Config, deps: Deps) -> anyhow::Result<Gateway> {
    init_tracing(&config);
    config.validate()?;

    let shutdown = CancellationToken::new();

    // The writer outlives the actors: its token is cancelled only after the
    // manager has drained, so the final flush sees every enqueued event.
    let writer_cancel = CancellationToken::new();
    let writer_config = WriterConfig {
        batch_size: config.persist_batch,
        flush_interval: config.persist_flush(),
        ..WriterConfig::default()
    };
    let (writer, writer_task) =
        persist::spawn(Arc::clone(&deps.event_store), writer_config, writer_cancel.clone());

    let manager = SessionManager::new(
        &config,
        Arc::clone(&deps.session_store),
        Arc::clone(&deps.event_store),
        writer.clone(),
        Arc::clone(&deps.connector),
        shutdown.clone(),
    );
    let renewal_task = manager.spawn_lease_renewal();

    let cleanup = CleanupScheduler::new(
        Arc::clone(&deps.session_store),
        Arc::clone(&deps.event_store),
        CleanupConfig::from_config(&config),
    );
    let cleanup_task = cleanup.spawn(shutdown.clone());

    let state = GatewayState::new(
        &config,
        Arc::clone(&manager),
        Arc::clone(&deps.validator),
        writer,
        shutdown.clone(),
    );
    let router = build_router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(gateway = %manager.gateway_id(), addr = %listener.local_addr()?, "gateway listening");

    Ok(Gateway {
        state,
        manager,
        shutdown,
        listener,
        router,
        writer_cancel,
        writer_task,
        renewal_task,
        cleanup_task,
    })
}

impl Gateway {
    /// The bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown token fires or SIGINT arrives, then tear
    /// down: cleanup → manager drain → writer final flush.
    pub async fn serve(self) -> anyhow::Result<()> {
        let shutdown = self.shutdown.clone();
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                signal_shutdown.cancel();
            }
        });

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await?;

        shutdown.cancel();
        let _ = self.cleanup_task.await;
        let _ = self.renewal_task.await;

        self.manager.shutdown_drain().await;

        self.writer_cancel.cancel();
        let _ = self.writer_task.await;

        info!("gateway stopped");
        Ok(())
    }
}

/// Run a gateway to completion with the binary's default collaborators.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let deps = Deps::for_binary(&config)?;
    prepare(config, deps).await?.serve().await
}
