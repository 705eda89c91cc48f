// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session runtime: the single-writer actor and its message surface.
//!
//! All mutations of one session happen inside its actor task. Callers hold
//! a [`SessionHandle`] and talk to the actor through [`SessionCommand`]
//! messages; there is no shared mutable session state outside the actor.

pub mod actor;
pub mod buffer;
pub mod lifecycle;
pub mod subscriber;
pub mod workflow;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCode;
use crate::event::{EventType, SessionEvent};
use crate::session::lifecycle::SessionStatus;
use crate::session::subscriber::SubscriberSink;
use crate::session::workflow::{InputResolution, WorkflowStatus};

pub use actor::{spawn_actor, ActorConfig};

/// Successful attach: the replayed backlog plus the state a `subscribed`
/// frame carries.
pub struct AttachReply {
    pub missed: Vec<SessionEvent>,
    pub status: SessionStatus,
    pub workflow_status: WorkflowStatus,
    pub latest_seq: u64,
}

/// Snapshot for health reporting.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub user_id: String,
    pub agent_type: String,
    pub status: SessionStatus,
    pub workflow_status: WorkflowStatus,
    pub next_seq: u64,
    pub subscriber_count: usize,
}

/// Messages accepted by the session actor.
pub enum SessionCommand {
    Attach {
        client_id: String,
        device_kind: String,
        last_ack_seq: u64,
        sink: Box<dyn SubscriberSink>,
        reply: oneshot::Sender<Result<AttachReply, ErrorCode>>,
    },
    Detach {
        client_id: String,
    },
    Input {
        data: String,
        client_input_id: String,
        reply: oneshot::Sender<Result<u64, ErrorCode>>,
    },
    Ack {
        client_id: String,
        seq: u64,
    },
    /// Adapter-parsed agent event (final message, tool call/result).
    AgentEvent {
        event_type: EventType,
        payload: serde_json::Value,
    },
    SetStatus {
        status: SessionStatus,
        detail: Option<String>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    SetWorkflow {
        status: WorkflowStatus,
        detail: Option<String>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    RequestInput {
        question: String,
        options: Vec<String>,
        default_action: String,
        timeout: Option<std::time::Duration>,
        reply: oneshot::Sender<Result<DateTime<Utc>, ErrorCode>>,
    },
    ResolveInput {
        resolution: InputResolution,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    /// Graceful stop: stopping → drain → stopped, then the actor exits.
    Stop {
        reply: oneshot::Sender<()>,
    },
    /// Ownership lost: close subscribers with `LEASE_LOST` and halt without
    /// further persistence.
    LeaseLost,
}

/// Cloneable address of a live session actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub id: String,
    tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(id: String, tx: mpsc::Sender<SessionCommand>, cancel: CancellationToken) -> Self {
        Self { id, tx, cancel }
    }

    async fn send(&self, cmd: SessionCommand) -> Result<(), ErrorCode> {
        self.tx.send(cmd).await.map_err(|_| ErrorCode::SessionNotFound)
    }

    pub async fn attach(
        &self,
        client_id: &str,
        device_kind: &str,
        last_ack_seq: u64,
        sink: Box<dyn SubscriberSink>,
    ) -> Result<AttachReply, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Attach {
            client_id: client_id.to_owned(),
            device_kind: device_kind.to_owned(),
            last_ack_seq,
            sink,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn detach(&self, client_id: &str) {
        let _ = self.send(SessionCommand::Detach { client_id: client_id.to_owned() }).await;
    }

    pub async fn input(&self, data: &str, client_input_id: &str) -> Result<u64, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Input {
            data: data.to_owned(),
            client_input_id: client_input_id.to_owned(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn ack(&self, client_id: &str, seq: u64) {
        let _ = self
            .send(SessionCommand::Ack { client_id: client_id.to_owned(), seq })
            .await;
    }

    pub async fn agent_event(&self, event_type: EventType, payload: serde_json::Value) {
        let _ = self.send(SessionCommand::AgentEvent { event_type, payload }).await;
    }

    pub async fn set_status(
        &self,
        status: SessionStatus,
        detail: Option<String>,
    ) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetStatus { status, detail, reply }).await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn set_workflow(
        &self,
        status: WorkflowStatus,
        detail: Option<String>,
    ) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SetWorkflow { status, detail, reply }).await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn request_input(
        &self,
        question: &str,
        options: Vec<String>,
        default_action: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<DateTime<Utc>, ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::RequestInput {
            question: question.to_owned(),
            options,
            default_action: default_action.to_owned(),
            timeout,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn resolve_input(&self, resolution: InputResolution) -> Result<(), ErrorCode> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ResolveInput { resolution, reply }).await?;
        rx.await.map_err(|_| ErrorCode::SessionNotFound)?
    }

    pub async fn info(&self) -> Option<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Info { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Graceful stop; resolves once the actor has drained and exited its
    /// loop.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SessionCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Ownership loss teardown. Fire-and-forget; the cancellation token
    /// doubles as the signal in case the inbox is wedged.
    pub async fn lease_lost(&self) {
        let _ = self.send(SessionCommand::LeaseLost).await;
        self.cancel.cancel();
    }

    /// Cancellation token used at gateway shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
