// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriber records and the outbound sink seam.
//!
//! The actor holds subscribers by value; the socket lives behind
//! [`SubscriberSink`], so a subscriber never keeps a session alive and a
//! closed socket is discovered on the next send. Sends are non-blocking:
//! a full queue marks the subscriber slow and the actor prunes it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ErrorCode;
use crate::protocol::ServerMessage;

/// Result of a non-blocking send to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// The bounded queue is full — the subscriber is slow.
    Full,
    /// The receiving side is gone.
    Closed,
}

/// Outbound channel to one subscriber's socket.
pub trait SubscriberSink: Send + Sync {
    fn try_send(&self, msg: ServerMessage) -> SendOutcome;

    /// Record why the actor dropped this subscriber. The transport reads
    /// the reason after the stream ends and relays it before closing the
    /// socket.
    fn close(&self, reason: ErrorCode);
}

/// Shared close-reason cell, readable from the transport side.
#[derive(Clone, Default)]
pub struct CloseSignal(Arc<Mutex<Option<ErrorCode>>>);

impl CloseSignal {
    pub fn get(&self) -> Option<ErrorCode> {
        *self.0.lock()
    }
}

/// [`SubscriberSink`] backed by a bounded mpsc channel drained by the
/// connection's writer task.
pub struct MpscSink {
    tx: mpsc::Sender<ServerMessage>,
    reason: CloseSignal,
}

impl MpscSink {
    /// Create a sink with the given queue depth. Returns the sink, the
    /// receiver for the connection task, and the close-reason handle.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<ServerMessage>, CloseSignal) {
        let (tx, rx) = mpsc::channel(depth);
        let reason = CloseSignal::default();
        (Self { tx, reason: reason.clone() }, rx, reason)
    }
}

impl SubscriberSink for MpscSink {
    fn try_send(&self, msg: ServerMessage) -> SendOutcome {
        match self.tx.try_send(msg) {
            Ok(()) => SendOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    fn close(&self, reason: ErrorCode) {
        *self.reason.0.lock() = Some(reason);
    }
}

/// One attached subscriber, owned by the session actor.
pub struct Subscriber {
    pub client_id: String,
    pub device_kind: String,
    pub last_ack_seq: u64,
    pub connected_at: DateTime<Utc>,
    pub sink: Box<dyn SubscriberSink>,
}

impl Subscriber {
    pub fn new(
        client_id: String,
        device_kind: String,
        last_ack_seq: u64,
        sink: Box<dyn SubscriberSink>,
    ) -> Self {
        Self { client_id, device_kind, last_ack_seq, connected_at: Utc::now(), sink }
    }
}

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;
