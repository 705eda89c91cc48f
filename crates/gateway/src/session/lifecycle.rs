// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle status machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a session, as persisted and as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Provisioning,
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Terminal statuses accept no further transitions and no new events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether `self → next` is an allowed lifecycle transition.
    pub fn can_transition(&self, next: SessionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        // The fatal path is allowed from any non-terminal status.
        if next == Self::Error {
            return true;
        }
        matches!(
            (self, next),
            (Self::Provisioning, Self::Starting)
                | (Self::Starting, Self::Running)
                | (Self::Running, Self::Idle)
                | (Self::Idle, Self::Running)
                | (Self::Running, Self::Stopping)
                | (Self::Idle, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
