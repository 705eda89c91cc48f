// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: the registry of live actors on one gateway.
//!
//! Owns creation, cross-gateway load (lease claim + ring warm-up), removal
//! with drain, and the lease renewal loop. The registry map is locked for
//! membership changes only; everything session-scoped goes through the
//! actor's message inbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentConnector;
use crate::config::Config;
use crate::error::ErrorCode;
use crate::persist::PersistHandle;
use crate::session::actor::ActorConfig;
use crate::session::{spawn_actor, SessionHandle, SessionInfo};
use crate::store::{EventStore, LeaseOutcome, SessionRecord, SessionStore};

/// Parameters of a `create_session` request.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub user_id: String,
    pub agent_type: String,
    pub working_dir: String,
    pub worktree_id: Option<String>,
    pub repository_id: Option<String>,
}

/// Why a session could not be resolved on this gateway.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("session not found")]
    NotFound,
    #[error("session is owned by gateway {holder}")]
    Elsewhere { holder: String },
    #[error("session create failed: {0}")]
    CreateFailed(String),
    #[error("store error: {0}")]
    Store(String),
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::SessionNotFound,
            Self::Elsewhere { .. } => ErrorCode::AccessElsewhere,
            Self::CreateFailed(_) => ErrorCode::CreateFailed,
            Self::Store(_) => ErrorCode::Internal,
        }
    }
}

struct Resident {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

/// Registry of live session actors on this gateway.
pub struct SessionManager {
    gateway_id: String,
    sessions: Mutex<HashMap<String, Arc<Resident>>>,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    writer: PersistHandle,
    connector: Arc<dyn AgentConnector>,
    actor_config: ActorConfig,
    lease_timeout: Duration,
    lease_renew_interval: Duration,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventStore>,
        writer: PersistHandle,
        connector: Arc<dyn AgentConnector>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let gateway_id = config.resolved_gateway_id();
        let actor_config = ActorConfig {
            gateway_id: gateway_id.clone(),
            ring_max_events: config.ring_max_events,
            ring_max_bytes: config.ring_max_bytes,
            idle_after: config.idle_after(),
            default_input_timeout: config.input_timeout(),
            ..ActorConfig::default()
        };
        Arc::new(Self {
            gateway_id,
            sessions: Mutex::new(HashMap::new()),
            store,
            events,
            writer,
            connector,
            actor_config,
            lease_timeout: config.lease_timeout(),
            lease_renew_interval: config.lease_renew_interval(),
            shutdown,
        })
    }

    pub fn gateway_id(&self) -> &str {
        &self.gateway_id
    }

    /// Allocate an identifier, persist the initial record, claim the lease,
    /// and spawn the actor.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<SessionHandle, ResolveError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut record =
            SessionRecord::new(id.clone(), spec.user_id, spec.agent_type, spec.working_dir);
        record.worktree_id = spec.worktree_id;
        record.repository_id = spec.repository_id;

        self.store
            .insert_session(&record)
            .await
            .map_err(|e| ResolveError::CreateFailed(e.to_string()))?;

        let expires = Utc::now() + self.lease_chrono();
        match self
            .store
            .try_claim_lease(&id, &self.gateway_id, expires)
            .await
            .map_err(|e| ResolveError::CreateFailed(e.to_string()))?
        {
            LeaseOutcome::Claimed(claimed) => record = claimed,
            LeaseOutcome::HeldBy { gateway_id, .. } => {
                return Err(ResolveError::Elsewhere { holder: gateway_id });
            }
        }

        info!(session = %id, gateway = %self.gateway_id, "session created");
        Ok(self.install_actor(record))
    }

    /// Actor for `session_id` if resident on this gateway.
    pub fn get_session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(session_id).map(|r| r.handle.clone())
    }

    /// Resident actor, or claim + load from the durable store.
    ///
    /// A live foreign lease resolves to [`ResolveError::Elsewhere`] so the
    /// frontend can redirect the client to the owning gateway.
    pub async fn get_or_load_session(
        &self,
        session_id: &str,
    ) -> Result<SessionHandle, ResolveError> {
        if let Some(handle) = self.get_session(session_id) {
            return Ok(handle);
        }

        let record = self
            .store
            .get_session(session_id)
            .await
            .map_err(|e| ResolveError::Store(e.to_string()))?
            .ok_or(ResolveError::NotFound)?;

        if record.claimed_by.as_deref() != Some(self.gateway_id.as_str())
            && record.lease_live(Utc::now())
        {
            let holder = record.claimed_by.clone().unwrap_or_default();
            return Err(ResolveError::Elsewhere { holder });
        }

        let expires = Utc::now() + self.lease_chrono();
        let mut record = match self
            .store
            .try_claim_lease(session_id, &self.gateway_id, expires)
            .await
            .map_err(|e| ResolveError::Store(e.to_string()))?
        {
            LeaseOutcome::Claimed(record) => record,
            LeaseOutcome::HeldBy { gateway_id, .. } => {
                return Err(ResolveError::Elsewhere { holder: gateway_id });
            }
        };

        // Another task may have installed the actor while we were claiming.
        if let Some(handle) = self.get_session(session_id) {
            return Ok(handle);
        }

        // The record's next_seq can lag the event log if the previous owner
        // died between appends and record writes; the log is the truth.
        let latest = self
            .events
            .latest_seq(session_id)
            .await
            .map_err(|e| ResolveError::Store(e.to_string()))?;
        record.next_seq = record.next_seq.max(latest + 1);
        self.writer.set_watermark(session_id, latest);

        debug!(session = %session_id, gateway = %self.gateway_id, next_seq = record.next_seq,
               "claimed and loading session");
        Ok(self.install_actor(record))
    }

    fn install_actor(&self, record: SessionRecord) -> SessionHandle {
        let (handle, task) = spawn_actor(
            record,
            self.actor_config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            self.writer.clone(),
            Arc::clone(&self.connector),
        );
        let resident = Arc::new(Resident { handle: handle.clone(), task });
        self.sessions.lock().insert(handle.id.clone(), resident);
        handle
    }

    /// Stop a session: drain the actor, flush its events, release the
    /// lease, and drop it from the registry.
    pub async fn remove_session(&self, session_id: &str) -> Result<(), ResolveError> {
        let resident = self.sessions.lock().remove(session_id).ok_or(ResolveError::NotFound)?;
        resident.handle.stop().await;

        // The actor flushed on shutdown, but a paused writer surfaces here:
        // retry the drain with backoff before giving up (non-fatal).
        let mut delay = Duration::from_millis(100);
        for _ in 0..4 {
            match self.writer.drain_session(session_id).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(session = %session_id, "drain before removal failed: {e}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }

        self.writer.clear_watermark(session_id);
        let _ = self.store.release_lease(session_id, &self.gateway_id).await;
        info!(session = %session_id, "session removed");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Snapshots for health reporting.
    pub async fn info(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().values().map(|r| r.handle.clone()).collect();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(info) = handle.info().await {
                infos.push(info);
            }
        }
        infos
    }

    fn lease_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout).unwrap_or(chrono::Duration::seconds(15))
    }

    /// Background lease renewal at `lease_timeout / 3`. A failed renewal is
    /// treated as ownership loss: the actor is halted, its subscribers are
    /// closed with `LEASE_LOST`, and the session leaves the registry.
    pub fn spawn_lease_renewal(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.lease_renew_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.renew_all().await,
                    _ = manager.shutdown.cancelled() => break,
                }
            }
            debug!("lease renewal loop stopped");
        })
    }

    async fn renew_all(&self) {
        let handles: Vec<SessionHandle> =
            self.sessions.lock().values().map(|r| r.handle.clone()).collect();
        let expires = Utc::now() + self.lease_chrono();

        for handle in handles {
            let renewed = self.store.renew_lease(&handle.id, &self.gateway_id, expires).await;
            match renewed {
                Ok(true) => {}
                Ok(false) => {
                    warn!(session = %handle.id, "lease lost, tearing down local actor");
                    self.evict_lost(&handle).await;
                }
                Err(e) => {
                    warn!(session = %handle.id, "lease renewal failed ({e}), tearing down");
                    self.evict_lost(&handle).await;
                }
            }
        }
    }

    async fn evict_lost(&self, handle: &SessionHandle) {
        handle.lease_lost().await;
        self.writer.clear_watermark(&handle.id);
        self.sessions.lock().remove(&handle.id);
    }

    /// Shutdown drain: stop every resident actor and await its task, then
    /// release the leases. Called before the writer's final flush.
    pub async fn shutdown_drain(&self) {
        let drained: Vec<(String, Arc<Resident>)> = self.sessions.lock().drain().collect();
        for (id, resident) in drained {
            resident.handle.stop().await;
            if let Some(resident) = Arc::into_inner(resident) {
                let _ = resident.task.await;
            }
            let _ = self.store.release_lease(&id, &self.gateway_id).await;
        }
    }

}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("gateway_id", &self.gateway_id)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
