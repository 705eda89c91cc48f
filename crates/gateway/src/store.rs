// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable store contracts and the in-memory reference implementation.
//!
//! The core depends only on the [`SessionStore`] and [`EventStore`] traits.
//! Cross-gateway concurrency is mediated entirely through the lease fields:
//! claims and renewals are compare-and-set, and session-record writes are
//! rejected unless the writing gateway still holds the lease.
//!
//! [`MemoryStore`] backs tests and single-node deployments. Multi-gateway
//! deployments implement the same traits over their database; the contract
//! they must honor is upsert on `(session_id, seq)` and CAS lease semantics,
//! nothing more.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::SessionEvent;
use crate::session::lifecycle::SessionStatus;
use crate::session::workflow::{AwaitingInput, InputResolution, WorkflowStatus};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lease not held by this gateway")]
    LeaseConflict,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One row of the `sessions` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub user_id: String,
    pub agent_type: String,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_id: Option<String>,
    pub status: SessionStatus,
    pub workflow_status: WorkflowStatus,
    /// Next sequence number to assign; strictly increasing, starts at 1.
    pub next_seq: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_input: Option<AwaitingInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_resolution: Option<InputResolution>,
}

impl SessionRecord {
    /// A freshly created session record in `provisioning`.
    pub fn new(id: String, user_id: String, agent_type: String, working_dir: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            agent_type,
            working_dir,
            worktree_id: None,
            repository_id: None,
            status: SessionStatus::Provisioning,
            workflow_status: WorkflowStatus::Started,
            next_seq: 1,
            created_at: now,
            last_activity_at: now,
            claimed_by: None,
            lease_expires_at: None,
            last_error: None,
            awaiting_input: None,
            input_resolution: None,
        }
    }

    /// Whether the lease is live at `now`.
    pub fn lease_live(&self, now: DateTime<Utc>) -> bool {
        matches!(self.lease_expires_at, Some(expiry) if expiry > now)
    }
}

/// Outcome of a lease claim attempt.
#[derive(Debug, Clone)]
pub enum LeaseOutcome {
    /// The lease is ours; the record reflects the claim.
    Claimed(SessionRecord),
    /// Another gateway holds a live lease.
    HeldBy { gateway_id: String, expires_at: DateTime<Utc> },
}

/// One row of the `session_connections` collection (observability).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub session_id: String,
    pub client_id: String,
    pub device_kind: String,
    pub connected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub last_ack_seq: u64,
}

/// Durable session metadata and lease coordination.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, record: &SessionRecord) -> StoreResult<()>;

    async fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>>;

    /// Persist a session record. Rejected with [`StoreError::LeaseConflict`]
    /// unless `gateway_id` holds the lease — all writes come from the
    /// leaseholder.
    async fn update_session(&self, record: &SessionRecord, gateway_id: &str) -> StoreResult<()>;

    /// Compare-and-set lease claim: succeeds when the lease is absent,
    /// expired, or already ours.
    async fn try_claim_lease(
        &self,
        id: &str,
        gateway_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome>;

    /// Renew the lease. Returns `false` when the claim has been lost; the
    /// stored expiry only moves forward.
    async fn renew_lease(
        &self,
        id: &str,
        gateway_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Release the lease if held by `gateway_id`. No-op otherwise.
    async fn release_lease(&self, id: &str, gateway_id: &str) -> StoreResult<()>;

    /// Bump `last_activity_at` without a full record write.
    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Mark a session stopped with a reason. Used by the cleanup sweep; does
    /// not require a lease because the sweep is the sole writer of terminal
    /// marks.
    async fn mark_stopped(&self, id: &str, reason: &str) -> StoreResult<()>;

    // Bounded cleanup queries.

    /// Sessions whose lease expired before `cutoff` and are not terminal.
    async fn stale_lease_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>>;

    /// Running/idle sessions with no activity since `cutoff`.
    async fn idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>>;

    /// Non-terminal sessions created before `cutoff`.
    async fn aged_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>>;

    /// Stopped sessions, for event retention sweeps.
    async fn stopped_sessions(&self, limit: usize) -> StoreResult<Vec<SessionRecord>>;

    // Connection observability.

    async fn upsert_connection(&self, record: &ConnectionRecord) -> StoreResult<()>;

    async fn close_connection(
        &self,
        session_id: &str,
        client_id: &str,
        last_ack_seq: u64,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Minimum acknowledged seq over open connections, if any.
    async fn min_connection_ack(&self, session_id: &str) -> StoreResult<Option<u64>>;
}

/// Durable, per-session ordered event log.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch. Upsert semantics on `(session_id, seq)`: retrying a
    /// batch that partially landed is safe and idempotent.
    async fn append_events(&self, session_id: &str, events: &[SessionEvent]) -> StoreResult<()>;

    /// Read up to `limit` events with `seq >= from_seq`, ascending.
    async fn read_events(
        &self,
        session_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<SessionEvent>>;

    /// Delete events with `seq < below_seq`. Returns the number removed.
    async fn delete_events_below(&self, session_id: &str, below_seq: u64) -> StoreResult<u64>;

    /// Highest persisted seq for the session, 0 when none.
    async fn latest_seq(&self, session_id: &str) -> StoreResult<u64>;
}

// -- In-memory implementation -------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<String, SessionRecord>,
    events: HashMap<String, BTreeMap<u64, SessionEvent>>,
    connections: HashMap<(String, String), ConnectionRecord>,
}

/// Deterministic in-memory store used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&record.id) {
            return Err(StoreError::Conflict(format!("session {} exists", record.id)));
        }
        inner.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StoreResult<Option<SessionRecord>> {
        Ok(self.inner.lock().sessions.get(id).cloned())
    }

    async fn update_session(&self, record: &SessionRecord, gateway_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let stored = inner
            .sessions
            .get_mut(&record.id)
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;
        if stored.claimed_by.as_deref() != Some(gateway_id) {
            return Err(StoreError::LeaseConflict);
        }
        // Lease fields stay authoritative in the store; the record write
        // never moves them.
        let claimed_by = stored.claimed_by.clone();
        let lease_expires_at = stored.lease_expires_at;
        *stored = record.clone();
        stored.claimed_by = claimed_by;
        stored.lease_expires_at = lease_expires_at;
        Ok(())
    }

    async fn try_claim_lease(
        &self,
        id: &str,
        gateway_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<LeaseOutcome> {
        let mut inner = self.inner.lock();
        let stored =
            inner.sessions.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        let now = Utc::now();
        match (&stored.claimed_by, stored.lease_expires_at) {
            (Some(holder), Some(expiry)) if expiry > now && holder != gateway_id => {
                Ok(LeaseOutcome::HeldBy { gateway_id: holder.clone(), expires_at: expiry })
            }
            _ => {
                // Re-claiming our own live lease keeps the expiry monotone;
                // a steal of an expired lease takes the new expiry as-is.
                let monotone = match (stored.claimed_by.as_deref(), stored.lease_expires_at) {
                    (Some(holder), Some(current)) if holder == gateway_id => {
                        expires_at.max(current)
                    }
                    _ => expires_at,
                };
                stored.claimed_by = Some(gateway_id.to_owned());
                stored.lease_expires_at = Some(monotone);
                Ok(LeaseOutcome::Claimed(stored.clone()))
            }
        }
    }

    async fn renew_lease(
        &self,
        id: &str,
        gateway_id: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let stored =
            inner.sessions.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if stored.claimed_by.as_deref() != Some(gateway_id) {
            return Ok(false);
        }
        // Monotone expiry: renewal never moves the deadline backwards.
        let current = stored.lease_expires_at.unwrap_or(expires_at);
        stored.lease_expires_at = Some(expires_at.max(current));
        Ok(true)
    }

    async fn release_lease(&self, id: &str, gateway_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.sessions.get_mut(id) {
            if stored.claimed_by.as_deref() == Some(gateway_id) {
                stored.claimed_by = None;
                stored.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn touch_activity(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let stored =
            inner.sessions.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if at > stored.last_activity_at {
            stored.last_activity_at = at;
        }
        Ok(())
    }

    async fn mark_stopped(&self, id: &str, reason: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let stored =
            inner.sessions.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        if !stored.status.is_terminal() {
            stored.status = SessionStatus::Stopped;
            stored.last_error = Some(reason.to_owned());
        }
        Ok(())
    }

    async fn stale_lease_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| matches!(s.lease_expires_at, Some(expiry) if expiry < cutoff))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn idle_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|s| matches!(s.status, SessionStatus::Running | SessionStatus::Idle))
            .filter(|s| s.last_activity_at < cutoff)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn aged_sessions(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| s.created_at < cutoff)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stopped_sessions(&self, limit: usize) -> StoreResult<Vec<SessionRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Stopped)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_connection(&self, record: &ConnectionRecord) -> StoreResult<()> {
        let key = (record.session_id.clone(), record.client_id.clone());
        self.inner.lock().connections.insert(key, record.clone());
        Ok(())
    }

    async fn close_connection(
        &self,
        session_id: &str,
        client_id: &str,
        last_ack_seq: u64,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some(conn) =
            inner.connections.get_mut(&(session_id.to_owned(), client_id.to_owned()))
        {
            conn.disconnected_at = Some(at);
            conn.last_ack_seq = last_ack_seq;
        }
        Ok(())
    }

    async fn min_connection_ack(&self, session_id: &str) -> StoreResult<Option<u64>> {
        let inner = self.inner.lock();
        Ok(inner
            .connections
            .values()
            .filter(|c| c.session_id == session_id && c.disconnected_at.is_none())
            .map(|c| c.last_ack_seq)
            .min())
    }
}

#[async_trait::async_trait]
impl EventStore for MemoryStore {
    async fn append_events(&self, session_id: &str, events: &[SessionEvent]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let log = inner.events.entry(session_id.to_owned()).or_default();
        for event in events {
            // Upsert on (session_id, seq).
            log.insert(event.seq, event.clone());
        }
        Ok(())
    }

    async fn read_events(
        &self,
        session_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> StoreResult<Vec<SessionEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .get(session_id)
            .map(|log| log.range(from_seq..).take(limit).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete_events_below(&self, session_id: &str, below_seq: u64) -> StoreResult<u64> {
        let mut inner = self.inner.lock();
        let Some(log) = inner.events.get_mut(session_id) else {
            return Ok(0);
        };
        let before = log.len();
        log.retain(|seq, _| *seq >= below_seq);
        Ok((before - log.len()) as u64)
    }

    async fn latest_seq(&self, session_id: &str) -> StoreResult<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .get(session_id)
            .and_then(|log| log.keys().next_back().copied())
            .unwrap_or(0))
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
