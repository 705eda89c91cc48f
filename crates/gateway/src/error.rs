// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unified error codes carried on `error` frames of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidMessage,
    NotAuthenticated,
    AuthFailed,
    SessionNotFound,
    AccessDenied,
    AccessElsewhere,
    ReplayUnavailable,
    SlowSubscriber,
    LeaseLost,
    InvalidTransition,
    CreateFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::AccessElsewhere => "ACCESS_ELSEWHERE",
            Self::ReplayUnavailable => "REPLAY_UNAVAILABLE",
            Self::SlowSubscriber => "SLOW_SUBSCRIBER",
            Self::LeaseLost => "LEASE_LOST",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::CreateFailed => "CREATE_FAILED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        match self {
            Self::CreateFailed | Self::Internal => true,
            Self::InvalidMessage
            | Self::NotAuthenticated
            | Self::AuthFailed
            | Self::SessionNotFound
            | Self::AccessDenied
            | Self::AccessElsewhere
            | Self::ReplayUnavailable
            | Self::SlowSubscriber
            | Self::LeaseLost
            | Self::InvalidTransition => false,
        }
    }

    /// Whether the frontend closes the connection after sending this error.
    ///
    /// Protocol and lookup errors keep the connection open; failed
    /// authentication and capacity/ownership evictions close it.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::AuthFailed | Self::SlowSubscriber | Self::LeaseLost)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorCode {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
