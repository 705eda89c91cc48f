// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic sweeper for stale leases, idle and aged sessions, and old
//! events.
//!
//! The scheduler only mutates the durable store; it never touches
//! in-memory actors. Under multi-gateway operation every gateway may run
//! the sweep — the store is the single source of truth and the marks are
//! idempotent. The next lease expiry/claim cycle finishes the work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::{EventStore, SessionStore};

/// Rows examined per query per pass.
const SWEEP_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval: Duration,
    pub stale_lease_grace: Duration,
    /// Zero disables the idle sweep.
    pub idle_timeout: Duration,
    /// Zero disables the age sweep.
    pub max_session_age: Duration,
    /// Events kept behind the latest seq for stopped sessions.
    pub retention_tail: u64,
}

impl CleanupConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.cleanup_interval(),
            stale_lease_grace: config.stale_lease_grace(),
            idle_timeout: config.idle_timeout(),
            max_session_age: config.max_session_age(),
            retention_tail: config.retention_tail,
        }
    }
}

pub struct CleanupScheduler {
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        events: Arc<dyn EventStore>,
        config: CleanupConfig,
    ) -> Self {
        Self { store, events, config }
    }

    /// Run the sweep on one timer until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep().await,
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("cleanup scheduler stopped");
        })
    }

    /// One pass: four bounded queries against the store.
    pub async fn sweep(&self) {
        let now = Utc::now();

        // 1. Stale leases: the owner stopped renewing long ago.
        let stale_cutoff = now
            - chrono::Duration::from_std(self.config.stale_lease_grace)
                .unwrap_or(chrono::Duration::seconds(300));
        match self.store.stale_lease_sessions(stale_cutoff, SWEEP_LIMIT).await {
            Ok(sessions) => {
                for session in sessions {
                    info!(session = %session.id, "stopping session with stale lease");
                    let _ = self.store.mark_stopped(&session.id, "stale lease").await;
                }
            }
            Err(e) => warn!("stale lease query failed: {e}"),
        }

        // 2. Idle sessions.
        if self.config.idle_timeout > Duration::ZERO {
            let idle_cutoff = now
                - chrono::Duration::from_std(self.config.idle_timeout)
                    .unwrap_or(chrono::Duration::hours(1));
            match self.store.idle_sessions(idle_cutoff, SWEEP_LIMIT).await {
                Ok(sessions) => {
                    for session in sessions {
                        info!(session = %session.id, "stopping idle session");
                        let _ = self.store.mark_stopped(&session.id, "idle timeout").await;
                    }
                }
                Err(e) => warn!("idle session query failed: {e}"),
            }
        }

        // 3. Aged sessions.
        if self.config.max_session_age > Duration::ZERO {
            let age_cutoff = now
                - chrono::Duration::from_std(self.config.max_session_age)
                    .unwrap_or(chrono::Duration::days(7));
            match self.store.aged_sessions(age_cutoff, SWEEP_LIMIT).await {
                Ok(sessions) => {
                    for session in sessions {
                        info!(session = %session.id, "stopping session past max age");
                        let _ = self.store.mark_stopped(&session.id, "max session age").await;
                    }
                }
                Err(e) => warn!("aged session query failed: {e}"),
            }
        }

        // 4. Old events of stopped sessions, below the ack/retention
        //    watermark.
        match self.store.stopped_sessions(SWEEP_LIMIT).await {
            Ok(sessions) => {
                for session in sessions {
                    if let Err(e) = self.trim_events(&session.id).await {
                        warn!(session = %session.id, "event trim failed: {e}");
                    }
                }
            }
            Err(e) => warn!("stopped session query failed: {e}"),
        }
    }

    /// Delete events below `min(min ack over connections, retention tail)`.
    async fn trim_events(&self, session_id: &str) -> Result<(), crate::store::StoreError> {
        let latest = self.events.latest_seq(session_id).await?;
        if latest == 0 {
            return Ok(());
        }
        let tail_floor = latest.saturating_sub(self.config.retention_tail) + 1;
        let min_ack = self.store.min_connection_ack(session_id).await?;
        let watermark = match min_ack {
            Some(ack) => tail_floor.min(ack + 1),
            None => tail_floor,
        };
        if watermark > 1 {
            let removed = self.events.delete_events_below(session_id, watermark).await?;
            if removed > 0 {
                debug!(session = %session_id, removed, watermark, "trimmed old events");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "cleanup_tests.rs"]
mod tests;
