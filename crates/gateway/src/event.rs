// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session event model.
//!
//! Every mutation of a session is recorded as a [`SessionEvent`] with a
//! per-session dense sequence number assigned by the session actor. Payloads
//! are opaque JSON once constructed; the helpers here build the payload
//! shapes the core itself emits (chunks, inputs, state transitions).

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Client,
    Agent,
    /// Reserved for state transitions and timeouts.
    System,
}

/// What kind of event this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    OutputChunk,
    MessageFinal,
    Input,
    ToolCall,
    ToolResult,
    State,
    Error,
    Heartbeat,
}

/// An event body before the actor stamps a sequence number.
#[derive(Debug, Clone)]
pub struct EventBody {
    pub direction: Direction,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// A sequenced, immutable session event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub seq: u64,
    pub direction: Direction,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn new(seq: u64, body: EventBody) -> Self {
        Self {
            seq,
            direction: body.direction,
            event_type: body.event_type,
            payload: body.payload,
            created_at: Utc::now(),
        }
    }

    /// Approximate payload size used for ring-buffer byte accounting.
    pub fn payload_bytes(&self) -> usize {
        payload_size(&self.payload)
    }
}

/// Recursive JSON size estimate. Cheap and stable — used only to bound the
/// ring buffer, not for billing.
fn payload_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null => 4,
        serde_json::Value::Bool(_) => 5,
        serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len() + 2,
        serde_json::Value::Array(items) => 2 + items.iter().map(payload_size).sum::<usize>(),
        serde_json::Value::Object(map) => {
            2 + map.iter().map(|(k, v)| k.len() + 4 + payload_size(v)).sum::<usize>()
        }
    }
}

impl EventBody {
    /// A raw agent output chunk. Bytes are base64-encoded so arbitrary agent
    /// output survives JSON transport.
    pub fn output_chunk(data: &Bytes) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        Self {
            direction: Direction::Agent,
            event_type: EventType::OutputChunk,
            payload: serde_json::json!({ "data": encoded }),
        }
    }

    /// A client input, recorded with its dedup key.
    pub fn input(data: &str, client_input_id: &str) -> Self {
        Self {
            direction: Direction::Client,
            event_type: EventType::Input,
            payload: serde_json::json!({ "data": data, "clientInputId": client_input_id }),
        }
    }

    /// A lifecycle status transition.
    pub fn lifecycle_state(from: &str, to: &str, detail: Option<&str>) -> Self {
        let mut payload = serde_json::json!({ "kind": "lifecycle", "from": from, "to": to });
        if let Some(detail) = detail {
            payload["detail"] = serde_json::Value::String(detail.to_owned());
        }
        Self { direction: Direction::System, event_type: EventType::State, payload }
    }

    /// A workflow status transition with optional structured extras
    /// (awaiting-input context, resolutions).
    pub fn workflow_state(from: &str, to: &str, extra: serde_json::Value) -> Self {
        let mut payload = serde_json::json!({ "kind": "workflow", "from": from, "to": to });
        if let serde_json::Value::Object(map) = extra {
            for (k, v) in map {
                payload[k] = v;
            }
        }
        Self { direction: Direction::System, event_type: EventType::State, payload }
    }

    /// An adapter-supplied agent event (final message, tool call/result).
    pub fn agent_event(event_type: EventType, payload: serde_json::Value) -> Self {
        Self { direction: Direction::Agent, event_type, payload }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
