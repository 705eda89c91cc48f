// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-writer session actor.
//!
//! One task owns everything mutable about a session: the record, the ring
//! buffer, the subscriber set, the workflow machines, and the pending
//! timers. The select-loop multiplexes the command inbox, the agent output
//! stream, the awaiting-input deadline, and the idle deadline.
//!
//! Suspension discipline: the actor never blocks on a subscriber (bounded
//! queues, slow consumers are dropped). It waits on the persistence writer
//! only when its bounded queue is full, and on the agent outbound buffer
//! only for a bounded interval — both waits are the backpressure path and
//! propagate to the agent through the bounded inbox.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{AgentConnector, AgentExit};
use crate::error::ErrorCode;
use crate::event::{EventBody, SessionEvent};
use crate::persist::{EnqueueError, PersistHandle};
use crate::protocol::ServerMessage;
use crate::session::buffer::EventRing;
use crate::session::lifecycle::SessionStatus;
use crate::session::subscriber::{SendOutcome, Subscriber};
use crate::session::workflow::{AwaitingInput, InputResolution, WorkflowStatus};
use crate::store::{EventStore, SessionRecord, SessionStore};

use super::{AttachReply, SessionCommand, SessionHandle, SessionInfo};

/// Per-actor tuning, derived from gateway [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub gateway_id: String,
    pub ring_max_events: usize,
    pub ring_max_bytes: usize,
    /// Running → idle after this much quiet time (zero disables).
    pub idle_after: Duration,
    /// Awaiting-input expiry when a request carries no timeout.
    pub default_input_timeout: Duration,
    /// Bounded inbox from the agent reader; a full inbox stalls the agent.
    pub agent_inbox_depth: usize,
    /// Bounded command inbox depth.
    pub command_inbox_depth: usize,
    /// Longest the actor waits on a full agent outbound buffer before
    /// dropping the forwarded bytes (the input event is already recorded).
    pub agent_send_timeout: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            gateway_id: "gw-local".to_owned(),
            ring_max_events: 1024,
            ring_max_bytes: 1 << 20,
            idle_after: Duration::from_secs(300),
            default_input_timeout: Duration::from_secs(3600),
            agent_inbox_depth: 256,
            command_inbox_depth: 256,
            agent_send_timeout: Duration::from_secs(1),
        }
    }
}

/// Remembered `clientInputId → seq` assignments. Bounded; oldest evicted.
struct InputDedup {
    entries: VecDeque<(String, u64)>,
    capacity: usize,
}

impl InputDedup {
    fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), capacity }
    }

    fn get(&self, client_input_id: &str) -> Option<u64> {
        self.entries.iter().find(|(id, _)| id == client_input_id).map(|(_, seq)| *seq)
    }

    fn insert(&mut self, client_input_id: String, seq: u64) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((client_input_id, seq));
    }
}

enum Flow {
    Continue,
    /// Graceful stop requested; reply once drained.
    Stop(oneshot::Sender<()>),
    /// Lease lost; halt without further persistence.
    Halt,
}

/// Spawn a session actor for `record`. Returns the handle and the join
/// handle the manager awaits on removal.
pub fn spawn_actor(
    record: SessionRecord,
    config: ActorConfig,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    writer: PersistHandle,
    connector: Arc<dyn AgentConnector>,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, inbox) = mpsc::channel(config.command_inbox_depth);
    let cancel = CancellationToken::new();
    let handle = SessionHandle::new(record.id.clone(), tx, cancel.clone());

    let actor = SessionActor {
        ring: EventRing::new(config.ring_max_events, config.ring_max_bytes),
        record,
        config,
        store,
        events,
        writer,
        subscribers: HashMap::new(),
        input_dedup: InputDedup::new(128),
        agent_tx: None,
        agent_task: None,
        awaiting_deadline: None,
        idle_deadline: None,
        last_store_touch: tokio::time::Instant::now(),
        halted: false,
        cancel,
    };
    let task = tokio::spawn(actor.run(connector, inbox));
    (handle, task)
}

struct SessionActor {
    record: SessionRecord,
    config: ActorConfig,
    store: Arc<dyn SessionStore>,
    events: Arc<dyn EventStore>,
    writer: PersistHandle,
    ring: EventRing,
    subscribers: HashMap<String, Subscriber>,
    input_dedup: InputDedup,
    agent_tx: Option<mpsc::Sender<Bytes>>,
    agent_task: Option<JoinHandle<anyhow::Result<AgentExit>>>,
    awaiting_deadline: Option<tokio::time::Instant>,
    idle_deadline: Option<tokio::time::Instant>,
    last_store_touch: tokio::time::Instant,
    halted: bool,
    cancel: CancellationToken,
}

/// Receive on an optional channel; pending forever when absent.
async fn recv_opt(rx: &mut Option<mpsc::Receiver<Bytes>>) -> Option<Bytes> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until an optional deadline; pending forever when absent.
async fn sleep_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        connector: Arc<dyn AgentConnector>,
        mut inbox: mpsc::Receiver<SessionCommand>,
    ) {
        self.warm_ring().await;
        let mut agent_rx = self.start_agent(connector).await;
        let cancel = self.cancel.clone();
        let mut stop_reply = None;

        loop {
            let awaiting_at = self.awaiting_deadline;
            let idle_at = self.idle_deadline;

            tokio::select! {
                cmd = inbox.recv() => {
                    match cmd {
                        Some(cmd) => match self.handle_command(cmd).await {
                            Flow::Continue => {}
                            Flow::Stop(reply) => {
                                stop_reply = Some(reply);
                                break;
                            }
                            Flow::Halt => {
                                self.halt().await;
                                return;
                            }
                        },
                        // Manager dropped the handle.
                        None => break,
                    }
                }

                chunk = recv_opt(&mut agent_rx) => {
                    match chunk {
                        Some(bytes) => self.handle_agent_output(bytes).await,
                        None => {
                            agent_rx = None;
                            self.handle_agent_closed().await;
                        }
                    }
                }

                _ = sleep_opt(awaiting_at), if awaiting_at.is_some() => {
                    self.expire_awaiting_input().await;
                }

                _ = sleep_opt(idle_at), if idle_at.is_some() => {
                    self.enter_idle().await;
                }

                _ = cancel.cancelled() => break,
            }
        }

        self.shutdown(agent_rx).await;
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    // -- Startup ---------------------------------------------------------------

    /// Best-effort ring warm-up from the tail of the event log, so sessions
    /// loaded after a migration serve recent replays without a store read.
    async fn warm_ring(&mut self) {
        if self.record.next_seq <= 1 || !self.ring.is_empty() {
            return;
        }
        let latest = self.record.next_seq - 1;
        let window = (self.config.ring_max_events.min(256)) as u64;
        let from = latest.saturating_sub(window - 1).max(1);
        match self.events.read_events(&self.record.id, from, window as usize).await {
            Ok(events) => {
                for event in events {
                    self.ring.push(event);
                }
                // These came from the store, so dropping over-budget head
                // entries loses nothing durable.
                while self.ring.over_limit() {
                    self.ring.evict_head();
                }
            }
            Err(e) => debug!(session = %self.record.id, "ring warm-up skipped: {e}"),
        }
    }

    /// Connect the agent stream according to the record's lifecycle status.
    /// Freshly created sessions walk provisioning → starting → running;
    /// sessions loaded mid-life reconnect; terminal sessions stay agentless
    /// and serve replay only.
    async fn start_agent(&mut self, connector: Arc<dyn AgentConnector>) -> Option<mpsc::Receiver<Bytes>> {
        match self.record.status {
            SessionStatus::Provisioning => {
                let _ = self.set_lifecycle(SessionStatus::Starting, None).await;
            }
            SessionStatus::Starting | SessionStatus::Running | SessionStatus::Idle => {}
            SessionStatus::Stopping | SessionStatus::Stopped | SessionStatus::Error => {
                return None;
            }
        }

        match connector.connect(&self.record).await {
            Ok(backend) => {
                let (output_tx, output_rx) = mpsc::channel(self.config.agent_inbox_depth);
                let (input_tx, input_rx) = mpsc::channel::<Bytes>(self.config.agent_inbox_depth);
                self.agent_tx = Some(input_tx);
                self.agent_task = Some(tokio::spawn(backend.run(output_tx, input_rx)));

                if self.record.status != SessionStatus::Running {
                    let _ = self.set_lifecycle(SessionStatus::Running, None).await;
                }
                if self.record.workflow_status == WorkflowStatus::Started {
                    let _ = self.set_workflow(WorkflowStatus::Working, None).await;
                }
                // Re-arm the awaiting-input deadline after a migration.
                if let Some(ref pending) = self.record.awaiting_input {
                    self.awaiting_deadline = deadline_from(pending.expires_at);
                }
                Some(output_rx)
            }
            Err(e) => {
                warn!(session = %self.record.id, "agent connect failed: {e:#}");
                let _ = self
                    .set_lifecycle(SessionStatus::Error, Some(format!("agent connect failed: {e}")))
                    .await;
                None
            }
        }
    }

    // -- Command dispatch ------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Attach { client_id, device_kind, last_ack_seq, sink, reply } => {
                let result = self.attach(client_id, device_kind, last_ack_seq, sink).await;
                let _ = reply.send(result);
            }
            SessionCommand::Detach { client_id } => self.detach(&client_id).await,
            SessionCommand::Input { data, client_input_id, reply } => {
                let result = self.handle_input(data, client_input_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::Ack { client_id, seq } => self.update_ack(&client_id, seq),
            SessionCommand::AgentEvent { event_type, payload } => {
                if !self.record.status.is_terminal() {
                    self.note_activity().await;
                    self.append(EventBody::agent_event(event_type, payload)).await;
                }
            }
            SessionCommand::SetStatus { status, detail, reply } => {
                let result = self.set_lifecycle(status, detail).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetWorkflow { status, detail, reply } => {
                let result = self.set_workflow(status, detail).await;
                let _ = reply.send(result);
            }
            SessionCommand::RequestInput { question, options, default_action, timeout, reply } => {
                let result = self.request_input(question, options, default_action, timeout).await;
                let _ = reply.send(result);
            }
            SessionCommand::ResolveInput { resolution, reply } => {
                let result = self.resolve_input(resolution).await;
                let _ = reply.send(result);
            }
            SessionCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            SessionCommand::Stop { reply } => return Flow::Stop(reply),
            SessionCommand::LeaseLost => return Flow::Halt,
        }
        Flow::Continue
    }

    // -- Subscribers -----------------------------------------------------------

    /// Register (or replace) a subscriber and compute its replay backlog.
    async fn attach(
        &mut self,
        client_id: String,
        device_kind: String,
        last_ack_seq: u64,
        sink: Box<dyn crate::session::subscriber::SubscriberSink>,
    ) -> Result<AttachReply, ErrorCode> {
        // Idempotent re-attach: the new socket replaces the old one, whose
        // queued frames die with its channel; replay resumes from the
        // highest ack we know about.
        let resumed_ack = match self.subscribers.remove(&client_id) {
            Some(old) => old.last_ack_seq.max(last_ack_seq),
            None => last_ack_seq,
        };

        let missed = self.replay_events(resumed_ack).await?;

        let subscriber = Subscriber::new(client_id.clone(), device_kind.clone(), resumed_ack, sink);
        self.subscribers.insert(client_id.clone(), subscriber);

        if !self.halted {
            let _ = self
                .store
                .upsert_connection(&crate::store::ConnectionRecord {
                    session_id: self.record.id.clone(),
                    client_id,
                    device_kind,
                    connected_at: Utc::now(),
                    disconnected_at: None,
                    last_ack_seq: resumed_ack,
                })
                .await;
        }

        Ok(AttachReply {
            missed,
            status: self.record.status,
            workflow_status: self.record.workflow_status,
            latest_seq: self.record.next_seq - 1,
        })
    }

    /// Events with `seq > after`, from the ring when it still covers the
    /// range, else store prefix + ring tail. A gap anywhere means the range
    /// predates retention.
    async fn replay_events(&self, after: u64) -> Result<Vec<SessionEvent>, ErrorCode> {
        let latest = self.record.next_seq - 1;
        if after >= latest {
            return Ok(Vec::new());
        }
        if self.ring.covers_from(after) && !self.ring.is_empty() {
            return Ok(self.ring.events_after(after));
        }

        let ring_first = self.ring.first_seq().unwrap_or(latest + 1);
        let prefix_len = (ring_first - 1).saturating_sub(after) as usize;
        let stored = self
            .events
            .read_events(&self.record.id, after + 1, prefix_len)
            .await
            .map_err(|_| ErrorCode::Internal)?;

        let mut combined = stored;
        combined.extend(self.ring.events_after(ring_first.saturating_sub(1)));

        // The replayed range must be dense from after+1 to the latest seq.
        let mut expect = after + 1;
        for event in &combined {
            if event.seq != expect {
                return Err(ErrorCode::ReplayUnavailable);
            }
            expect += 1;
        }
        if expect != latest + 1 {
            return Err(ErrorCode::ReplayUnavailable);
        }
        Ok(combined)
    }

    async fn detach(&mut self, client_id: &str) {
        if let Some(sub) = self.subscribers.remove(client_id) {
            if !self.halted {
                let _ = self
                    .store
                    .close_connection(&self.record.id, client_id, sub.last_ack_seq, Utc::now())
                    .await;
            }
        }
    }

    fn update_ack(&mut self, client_id: &str, seq: u64) {
        if let Some(sub) = self.subscribers.get_mut(client_id) {
            sub.last_ack_seq = sub.last_ack_seq.max(seq);
        }
        self.trim_ring();
    }

    /// Evict fully-acknowledged, persisted head events. Only runs while
    /// subscribers are attached; an empty session keeps its tail for fast
    /// re-attach until the hard limits bite.
    fn trim_ring(&mut self) {
        let Some(min_ack) = self.subscribers.values().map(|s| s.last_ack_seq).min() else {
            return;
        };
        let persisted = self.writer.persisted_seq(&self.record.id);
        self.ring.trim_to(min_ack.min(persisted));
    }

    /// Fan one event out to every attached subscriber. Slow subscribers are
    /// closed with `SLOW_SUBSCRIBER` and pruned; their ack state survives in
    /// the connection record for the next replay.
    async fn fanout(&mut self, event: &SessionEvent) {
        let mut pruned: Vec<(String, Option<ErrorCode>)> = Vec::new();
        for (client_id, sub) in &self.subscribers {
            match sub.sink.try_send(ServerMessage::event(&self.record.id, event.clone())) {
                SendOutcome::Accepted => {}
                SendOutcome::Full => {
                    sub.sink.close(ErrorCode::SlowSubscriber);
                    pruned.push((client_id.clone(), Some(ErrorCode::SlowSubscriber)));
                }
                SendOutcome::Closed => pruned.push((client_id.clone(), None)),
            }
        }
        for (client_id, reason) in pruned {
            if let Some(reason) = reason {
                info!(session = %self.record.id, client = %client_id, "dropping subscriber: {reason}");
            }
            self.detach(&client_id).await;
        }
    }

    // -- Event append ----------------------------------------------------------

    /// Stamp the next sequence number, persist, buffer, and broadcast.
    async fn append(&mut self, body: EventBody) -> u64 {
        let seq = self.record.next_seq;
        self.record.next_seq += 1;
        let event = SessionEvent::new(seq, body);

        if !self.halted {
            if let Err(EnqueueError::Full) = self.writer.enqueue(&self.record.id, event.clone()) {
                // Backpressure: wait for writer capacity. The agent inbox is
                // bounded, so a persistent stall propagates to the agent.
                let _ = self.writer.enqueue_wait(&self.record.id, event.clone()).await;
            }
        }

        self.ring.push(event.clone());
        self.enforce_ring_limits().await;
        self.fanout(&event).await;
        seq
    }

    /// Hard-limit eviction, preceded by a forced flush when the head has
    /// not reached the writer's persistent tail yet.
    async fn enforce_ring_limits(&mut self) {
        while self.ring.over_limit() {
            let Some(head_seq) = self.ring.first_seq() else { break };
            if !self.halted && head_seq > self.writer.persisted_seq(&self.record.id) {
                if self.writer.drain_session(&self.record.id).await.is_err() {
                    // Writer paused: keep the events in memory rather than
                    // lose them. The bounded writer queue is what ultimately
                    // stalls producers.
                    break;
                }
            }
            self.ring.evict_head();
        }
    }

    // -- Client input ----------------------------------------------------------

    async fn handle_input(
        &mut self,
        data: String,
        client_input_id: String,
    ) -> Result<u64, ErrorCode> {
        if self.record.status.is_terminal() || self.record.status == SessionStatus::Stopping {
            return Err(ErrorCode::InvalidTransition);
        }

        // Retries with the same clientInputId return the original seq.
        if let Some(seq) = self.input_dedup.get(&client_input_id) {
            return Ok(seq);
        }

        // The input is sequenced and recorded unconditionally; only the
        // forwarding step below is subject to agent backpressure.
        self.note_activity().await;
        let seq = self.append(EventBody::input(&data, &client_input_id)).await;
        self.input_dedup.insert(client_input_id, seq);

        self.forward_to_agent(Bytes::from(data.clone().into_bytes())).await;

        // A human reply while awaiting input is its resolution.
        if self.record.workflow_status == WorkflowStatus::AwaitingInput {
            let _ = self.resolve_input(InputResolution::Human { value: data }).await;
        }

        Ok(seq)
    }

    /// Queue input bytes for the agent stream. A full outbound buffer is
    /// waited out for at most `agent_send_timeout`; past that the bytes are
    /// dropped with a warning — the input event itself is already durable,
    /// and an agent that stalls this long is not consuming anyway.
    async fn forward_to_agent(&self, bytes: Bytes) {
        let Some(ref tx) = self.agent_tx else {
            return;
        };
        match tx.try_send(bytes) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                let sent = tokio::time::timeout(self.config.agent_send_timeout, tx.send(bytes));
                if sent.await.is_err() {
                    warn!(session = %self.record.id, "agent outbound buffer full, input bytes dropped");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // -- Agent stream ----------------------------------------------------------

    async fn handle_agent_output(&mut self, bytes: Bytes) {
        if self.record.status.is_terminal() {
            return;
        }
        self.note_activity().await;
        self.append(EventBody::output_chunk(&bytes)).await;
    }

    /// The agent stream closed: surface the exit and settle the lifecycle.
    async fn handle_agent_closed(&mut self) {
        self.agent_tx = None;
        let exit = match self.agent_task.take() {
            Some(task) => match task.await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => {
                    warn!(session = %self.record.id, "agent stream error: {e:#}");
                    AgentExit { code: Some(1), signal: None }
                }
                Err(e) => {
                    warn!(session = %self.record.id, "agent task panicked: {e}");
                    AgentExit { code: Some(1), signal: None }
                }
            },
            None => return,
        };

        if self.record.status.is_terminal() || self.record.status == SessionStatus::Stopping {
            return;
        }

        if exit.clean() {
            let _ = self.set_lifecycle(SessionStatus::Stopping, Some("agent exited".into())).await;
            let _ = self.set_lifecycle(SessionStatus::Stopped, None).await;
        } else {
            let detail = format!("agent exited: code={:?} signal={:?}", exit.code, exit.signal);
            let _ = self.set_lifecycle(SessionStatus::Error, Some(detail)).await;
        }
    }

    // -- Lifecycle & workflow --------------------------------------------------

    /// Apply a lifecycle transition, emit its `state` event, persist the
    /// record. Forbidden transitions fail without emitting.
    async fn set_lifecycle(
        &mut self,
        next: SessionStatus,
        detail: Option<String>,
    ) -> Result<(), ErrorCode> {
        let prev = self.record.status;
        if prev == next {
            return Ok(());
        }
        if !prev.can_transition(next) {
            return Err(ErrorCode::InvalidTransition);
        }

        self.record.status = next;
        self.append(EventBody::lifecycle_state(prev.as_str(), next.as_str(), detail.as_deref()))
            .await;

        match next {
            SessionStatus::Running => {
                self.arm_idle_deadline();
            }
            SessionStatus::Idle => {
                self.idle_deadline = None;
            }
            SessionStatus::Stopping | SessionStatus::Stopped | SessionStatus::Error => {
                // Timers die with the live lifecycle.
                self.awaiting_deadline = None;
                self.idle_deadline = None;
            }
            _ => {}
        }
        if let Some(detail) = detail {
            if next == SessionStatus::Error {
                self.record.last_error = Some(detail);
            }
        }

        self.persist_record().await;
        Ok(())
    }

    /// Apply a workflow transition. Entering or leaving `awaiting_input`
    /// through this path is forbidden — those transitions must carry a
    /// question/expiry or a resolution and have their own operations.
    async fn set_workflow(
        &mut self,
        next: WorkflowStatus,
        detail: Option<String>,
    ) -> Result<(), ErrorCode> {
        let prev = self.record.workflow_status;
        if next == WorkflowStatus::AwaitingInput || prev == WorkflowStatus::AwaitingInput {
            return Err(ErrorCode::InvalidTransition);
        }
        if !prev.can_transition(next) {
            return Err(ErrorCode::InvalidTransition);
        }

        self.record.workflow_status = next;
        let extra = match detail {
            Some(ref d) => serde_json::json!({ "detail": d }),
            None => serde_json::json!({}),
        };
        self.append(EventBody::workflow_state(prev.as_str(), next.as_str(), extra)).await;
        self.persist_record().await;
        Ok(())
    }

    /// `working → awaiting_input` with question, default action, and expiry.
    async fn request_input(
        &mut self,
        question: String,
        options: Vec<String>,
        default_action: String,
        timeout: Option<Duration>,
    ) -> Result<DateTime<Utc>, ErrorCode> {
        if self.record.workflow_status != WorkflowStatus::Working {
            return Err(ErrorCode::InvalidTransition);
        }

        let timeout = timeout.unwrap_or(self.config.default_input_timeout);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(3600));

        let pending = AwaitingInput {
            question: question.clone(),
            options: options.clone(),
            default_action: default_action.clone(),
            expires_at,
        };
        self.record.workflow_status = WorkflowStatus::AwaitingInput;
        self.record.awaiting_input = Some(pending);
        self.record.input_resolution = None;
        self.awaiting_deadline = Some(tokio::time::Instant::now() + timeout);

        let mut extra = serde_json::json!({
            "question": question,
            "defaultAction": default_action,
            "expiresAt": expires_at.to_rfc3339(),
        });
        if !options.is_empty() {
            extra["options"] = serde_json::json!(options);
        }
        self.append(EventBody::workflow_state("working", "awaiting_input", extra)).await;
        self.persist_record().await;
        Ok(expires_at)
    }

    /// `awaiting_input → working`, carrying the resolution.
    async fn resolve_input(&mut self, resolution: InputResolution) -> Result<(), ErrorCode> {
        if self.record.workflow_status != WorkflowStatus::AwaitingInput {
            return Err(ErrorCode::InvalidTransition);
        }

        self.record.awaiting_input = None;
        self.record.workflow_status = WorkflowStatus::Working;
        self.awaiting_deadline = None;

        let mut extra = serde_json::json!({
            "resolution": serde_json::to_value(&resolution).unwrap_or_default(),
        });
        if let InputResolution::Timeout { ref value } = resolution {
            extra["message"] =
                serde_json::Value::String(format!("Timeout: proceeding with {value}"));
        }
        self.record.input_resolution = Some(resolution);

        self.append(EventBody::workflow_state("awaiting_input", "working", extra)).await;
        self.persist_record().await;
        Ok(())
    }

    /// Expiry timer fired: take the default action.
    async fn expire_awaiting_input(&mut self) {
        self.awaiting_deadline = None;
        let Some(ref pending) = self.record.awaiting_input else {
            return;
        };
        let value = pending.default_action.clone();
        debug!(session = %self.record.id, "awaiting-input expired, taking default: {value}");
        let _ = self.resolve_input(InputResolution::Timeout { value }).await;
    }

    // -- Activity & idle -------------------------------------------------------

    /// Any input or agent chunk counts as activity: bump the record, rearm
    /// the idle timer, wake an idle session, and occasionally flush the
    /// activity stamp to the store.
    async fn note_activity(&mut self) {
        self.record.last_activity_at = Utc::now();

        if self.record.status == SessionStatus::Idle {
            let _ = self.set_lifecycle(SessionStatus::Running, Some("activity".into())).await;
        } else if self.record.status == SessionStatus::Running {
            self.arm_idle_deadline();
        }

        if !self.halted && self.last_store_touch.elapsed() > Duration::from_secs(5) {
            self.last_store_touch = tokio::time::Instant::now();
            let _ = self.store.touch_activity(&self.record.id, self.record.last_activity_at).await;
        }
    }

    fn arm_idle_deadline(&mut self) {
        if self.config.idle_after > Duration::ZERO {
            self.idle_deadline = Some(tokio::time::Instant::now() + self.config.idle_after);
        }
    }

    async fn enter_idle(&mut self) {
        self.idle_deadline = None;
        if self.record.status == SessionStatus::Running {
            let _ = self.set_lifecycle(SessionStatus::Idle, None).await;
        }
    }

    // -- Persistence -----------------------------------------------------------

    /// Write the session record through the store. A lease conflict here
    /// means ownership moved while we were running: halt without further
    /// mutation.
    async fn persist_record(&mut self) {
        if self.halted {
            return;
        }
        match self.store.update_session(&self.record, &self.config.gateway_id).await {
            Ok(()) => {}
            Err(crate::store::StoreError::LeaseConflict) => {
                warn!(session = %self.record.id, "lease lost detected on record write, halting");
                self.halt().await;
            }
            Err(e) => {
                warn!(session = %self.record.id, "session record write failed: {e}");
            }
        }
    }

    // -- Teardown --------------------------------------------------------------

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.record.id.clone(),
            user_id: self.record.user_id.clone(),
            agent_type: self.record.agent_type.clone(),
            status: self.record.status,
            workflow_status: self.record.workflow_status,
            next_seq: self.record.next_seq,
            subscriber_count: self.subscribers.len(),
        }
    }

    /// Lease lost: close every subscriber with `LEASE_LOST`, stop timers,
    /// and stop persisting. No data mutation happens after loss detection.
    async fn halt(&mut self) {
        if self.halted {
            return;
        }
        self.halted = true;
        self.awaiting_deadline = None;
        self.idle_deadline = None;
        for (_, sub) in self.subscribers.drain() {
            sub.sink.close(ErrorCode::LeaseLost);
        }
        if let Some(task) = self.agent_task.take() {
            task.abort();
        }
        self.agent_tx = None;
        self.cancel.cancel();
    }

    /// Graceful teardown: stopping → drain agent output → stopped → flush.
    async fn shutdown(&mut self, mut agent_rx: Option<mpsc::Receiver<Bytes>>) {
        if self.halted {
            return;
        }

        if !self.record.status.is_terminal() {
            let _ = self.set_lifecycle(SessionStatus::Stopping, None).await;
        }

        // Close the agent input side and capture remaining output, bounded.
        self.agent_tx = None;
        if let Some(ref mut rx) = agent_rx {
            let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            loop {
                match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                    Ok(Some(bytes)) => {
                        self.append(EventBody::output_chunk(&bytes)).await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
        if let Some(task) = self.agent_task.take() {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(_) => {}
                Err(_) => debug!(session = %self.record.id, "agent task did not settle in time"),
            }
        }

        if !self.record.status.is_terminal() {
            let _ = self.set_lifecycle(SessionStatus::Stopped, None).await;
        }

        // Flush our events before the manager releases the lease.
        if self.writer.drain_session(&self.record.id).await.is_err() {
            warn!(session = %self.record.id, "drain on shutdown failed; writer is paused");
        }

        for (client_id, sub) in self.subscribers.drain().collect::<Vec<_>>() {
            let _ = self
                .store
                .close_connection(&self.record.id, &client_id, sub.last_ack_seq, Utc::now())
                .await;
        }
    }
}

/// Convert an absolute wall-clock expiry into a tokio deadline.
fn deadline_from(expires_at: DateTime<Utc>) -> Option<tokio::time::Instant> {
    let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Some(tokio::time::Instant::now() + remaining)
}

#[cfg(test)]
#[path = "actor_tests.rs"]
mod tests;
