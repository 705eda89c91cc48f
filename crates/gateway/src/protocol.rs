// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire protocol message types and codec.
//!
//! Messages are single framed JSON objects tagged by `type`, camelCase
//! fields, ISO-8601 UTC timestamps. Two top-level enums cover the two
//! directions; unknown tags, missing fields, and type mismatches all decode
//! to the single [`CodecError`] kind so the frontend can answer with one
//! `INVALID_MESSAGE` error shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::event::SessionEvent;
use crate::session::lifecycle::SessionStatus;
use crate::session::workflow::WorkflowStatus;

/// A frame failed to decode as any known client message.
#[derive(Debug, thiserror::Error)]
#[error("invalid message: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// Messages sent client → gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Hello {
        client_id: String,
        device_type: String,
        token: String,
    },
    Subscribe {
        session_id: String,
        #[serde(default)]
        last_ack_seq: u64,
    },
    Unsubscribe {
        session_id: String,
    },
    Input {
        session_id: String,
        client_input_id: String,
        data: String,
    },
    Ack {
        session_id: String,
        seq: u64,
    },
    Ping {},
    CreateSession {
        agent_type: String,
        working_directory: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worktree_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repository_id: Option<String>,
    },
    StopSession {
        session_id: String,
    },
}

/// Current session state carried on `subscribed` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub status: SessionStatus,
    pub workflow_status: WorkflowStatus,
}

/// Messages sent gateway → client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    HelloOk {
        gateway_time: DateTime<Utc>,
        heartbeat_interval_ms: u64,
        user_id: String,
    },
    Subscribed {
        session_id: String,
        current_state: SessionState,
        latest_seq: u64,
    },
    Unsubscribed {
        session_id: String,
    },
    InputAck {
        session_id: String,
        client_input_id: String,
        accepted_seq: u64,
    },
    Pong {},
    SessionCreated {
        session_id: String,
        status: SessionStatus,
    },
    SessionStopped {
        session_id: String,
    },
    Event {
        session_id: String,
        #[serde(flatten)]
        event: SessionEvent,
    },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        retryable: bool,
    },
}

impl ServerMessage {
    /// Build an `error` frame from a typed code.
    pub fn error(code: ErrorCode, message: impl Into<String>, session_id: Option<String>) -> Self {
        Self::Error {
            code: code.as_str().to_owned(),
            message: message.into(),
            session_id,
            retryable: code.retryable(),
        }
    }

    /// Wrap a session event for transport.
    pub fn event(session_id: &str, event: SessionEvent) -> Self {
        Self::Event { session_id: session_id.to_owned(), event }
    }
}

/// Decode one framed text payload into a client message.
pub fn decode_client(text: &str) -> Result<ClientMessage, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a server message as one framed text payload.
///
/// Serialization of our own types cannot fail in practice; a failure is
/// reported as an `INTERNAL_ERROR` frame rather than a dropped frame.
pub fn encode_server(msg: &ServerMessage) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        format!(
            "{{\"type\":\"error\",\"code\":\"INTERNAL_ERROR\",\"message\":\"encode failed: {e}\",\"retryable\":true}}"
        )
    })
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
