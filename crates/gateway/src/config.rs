// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use clap::Parser;

/// Multi-gateway session broker for interactive agent processes.
#[derive(Debug, Clone, Parser)]
#[command(name = "perch", version, about)]
pub struct Config {
    /// Unique identifier for this gateway process.
    #[arg(long, env = "PERCH_GATEWAY_ID")]
    pub gateway_id: Option<String>,

    /// Host address to bind to.
    #[arg(long, env = "PERCH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "PERCH_PORT", default_value = "4400")]
    pub port: u16,

    /// Shared bearer token for client authentication (unset = auth disabled).
    #[arg(long, env = "PERCH_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Agent endpoint the gateway connects sessions to (host:port).
    #[arg(long, env = "PERCH_AGENT_ENDPOINT")]
    pub agent_endpoint: Option<String>,

    /// Session lease timeout in milliseconds.
    #[arg(long, env = "PERCH_LEASE_TIMEOUT_MS", default_value = "15000")]
    pub lease_timeout_ms: u64,

    /// Cleanup sweep interval in seconds.
    #[arg(long, env = "PERCH_CLEANUP_INTERVAL", default_value = "60")]
    pub cleanup_interval: u64,

    /// Grace period in seconds before an expired lease counts as stale.
    #[arg(long, env = "PERCH_STALE_LEASE_GRACE", default_value = "300")]
    pub stale_lease_grace: u64,

    /// Idle timeout in seconds before a quiet running session is marked idle
    /// (0 = disabled).
    #[arg(long, env = "PERCH_IDLE_AFTER", default_value = "300")]
    pub idle_after: u64,

    /// Seconds without activity before the cleanup sweep stops a session
    /// (0 = disabled).
    #[arg(long, env = "PERCH_IDLE_TIMEOUT", default_value = "3600")]
    pub idle_timeout: u64,

    /// Maximum session age in seconds before the cleanup sweep stops it
    /// (0 = disabled).
    #[arg(long, env = "PERCH_MAX_SESSION_AGE", default_value = "604800")]
    pub max_session_age: u64,

    /// Events retained in the store for a stopped session.
    #[arg(long, env = "PERCH_RETENTION_TAIL", default_value = "1000")]
    pub retention_tail: u64,

    /// Persistence writer batch size.
    #[arg(long, env = "PERCH_PERSIST_BATCH", default_value = "64")]
    pub persist_batch: usize,

    /// Persistence writer flush interval in milliseconds.
    #[arg(long, env = "PERCH_PERSIST_FLUSH_MS", default_value = "250")]
    pub persist_flush_ms: u64,

    /// Server heartbeat interval in milliseconds.
    #[arg(long, env = "PERCH_HEARTBEAT_MS", default_value = "30000")]
    pub heartbeat_ms: u64,

    /// Ring buffer maximum event count per session.
    #[arg(long, env = "PERCH_RING_MAX_EVENTS", default_value = "1024")]
    pub ring_max_events: usize,

    /// Ring buffer maximum total payload bytes per session.
    #[arg(long, env = "PERCH_RING_MAX_BYTES", default_value = "1048576")]
    pub ring_max_bytes: usize,

    /// Per-subscriber outbound queue depth.
    #[arg(long, env = "PERCH_SUBSCRIBER_QUEUE", default_value = "64")]
    pub subscriber_queue: usize,

    /// Default awaiting-input timeout in minutes when a request carries none.
    #[arg(long, env = "PERCH_INPUT_TIMEOUT_MINUTES", default_value = "60")]
    pub input_timeout_minutes: u64,

    /// Log format (json or text).
    #[arg(long, env = "PERCH_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PERCH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lease_timeout_ms < 1000 {
            anyhow::bail!("--lease-timeout-ms must be at least 1000");
        }
        if self.persist_batch == 0 {
            anyhow::bail!("--persist-batch must be positive");
        }
        if self.subscriber_queue == 0 {
            anyhow::bail!("--subscriber-queue must be positive");
        }
        if self.ring_max_events == 0 || self.ring_max_bytes == 0 {
            anyhow::bail!("ring buffer limits must be positive");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Gateway id, generated once per process when not configured.
    pub fn resolved_gateway_id(&self) -> String {
        match self.gateway_id {
            Some(ref id) => id.clone(),
            None => format!("gw-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Lease renewal cadence: a third of the lease timeout.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms / 3)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn stale_lease_grace(&self) -> Duration {
        Duration::from_secs(self.stale_lease_grace)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age)
    }

    pub fn persist_flush(&self) -> Duration {
        Duration::from_millis(self.persist_flush_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.input_timeout_minutes * 60)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
