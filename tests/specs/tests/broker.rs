// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end broker scenarios over the real WebSocket protocol.

use std::sync::Arc;
use std::time::Duration;

use perch::event::{EventBody, SessionEvent};
use perch::manager::SessionManager;
use perch::session::lifecycle::SessionStatus;
use perch::session::workflow::WorkflowStatus;
use perch::store::{EventStore, MemoryStore, SessionRecord, SessionStore};
use perch::test_support::ScriptedConnector;

use perch_specs::{Client, GatewayRig, STARTUP_EVENTS};

/// Poll the resident actor until its next assigned seq reaches `next_seq`.
async fn wait_for_seq(
    manager: &Arc<SessionManager>,
    session_id: &str,
    next_seq: u64,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(handle) = manager.get_session(session_id) {
            if handle.info().await.is_some_and(|i| i.next_seq >= next_seq) {
                return Ok(());
            }
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "seq {next_seq} never reached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Replay across reconnect: a client that acked part of the stream gets
/// exactly the remainder, in order, on its next subscribe.
#[tokio::test]
async fn replay_across_reconnect() -> anyhow::Result<()> {
    let connector = ScriptedConnector::manual();
    let rig = GatewayRig::spawn(MemoryStore::new(), connector, &[]).await?;

    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let session_id = client.create_session().await?;

    let controller = rig.connector.controller(0).ok_or_else(|| anyhow::anyhow!("no agent"))?;
    for i in 0..100 {
        controller.emit(format!("chunk-{i}").as_bytes()).await;
    }
    let last = STARTUP_EVENTS + 100;

    let subscribed = client.subscribe(&session_id, 0).await?;
    assert_eq!(subscribed["currentState"]["status"], "running");
    client.collect_events_until(0, last).await?;

    client.ack(&session_id, 40).await?;
    drop(client);

    // Reconnect with the acked position: events 41.. replay in order,
    // then live events continue the same stream.
    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let subscribed = client.subscribe(&session_id, 40).await?;
    assert_eq!(subscribed["latestSeq"].as_u64(), Some(last));
    client.collect_events_until(40, last).await?;

    controller.emit(b"live-after-reconnect").await;
    let live = client.recv_type("event").await?;
    assert_eq!(live["seq"].as_u64(), Some(last + 1));
    Ok(())
}

/// Slow subscriber eviction: a subscriber that reads nothing is dropped
/// with `SLOW_SUBSCRIBER`; the session keeps running and a fresh
/// subscriber sees the complete stream.
#[tokio::test]
async fn slow_subscriber_eviction() -> anyhow::Result<()> {
    let connector = ScriptedConnector::manual();
    let rig =
        GatewayRig::spawn(MemoryStore::new(), connector, &["--subscriber-queue", "8"]).await?;

    let mut client = Client::connect_hello(rig.addr, "slow").await?;
    let session_id = client.create_session().await?;
    client.subscribe(&session_id, 0).await?;

    // Large chunks defeat socket buffering so the bounded queue overflows.
    let controller = rig.connector.controller(0).ok_or_else(|| anyhow::anyhow!("no agent"))?;
    let blob = vec![b'x'; 4096];
    for _ in 0..1000 {
        controller.emit(&blob).await;
    }
    let last = STARTUP_EVENTS + 1000;
    wait_for_seq(&rig.manager, &session_id, last + 1).await?;

    // Now drain: the queued frames arrive, then the eviction error, then
    // the server closes the socket.
    let frames = client.drain_to_close().await;
    let eviction = frames
        .iter()
        .rev()
        .find(|f| f["type"] == "error")
        .ok_or_else(|| anyhow::anyhow!("no error frame before close"))?;
    assert_eq!(eviction["code"], "SLOW_SUBSCRIBER");
    assert_eq!(eviction["sessionId"].as_str(), Some(session_id.as_str()));

    // The session survived and a fresh subscriber replays everything.
    let mut fresh = Client::connect_hello(rig.addr, "fresh").await?;
    let subscribed = fresh.subscribe(&session_id, 0).await?;
    assert_eq!(subscribed["latestSeq"].as_u64(), Some(last));
    let events = fresh.collect_events_until(0, last).await?;
    assert_eq!(events.len(), last as usize);
    Ok(())
}

/// Awaiting-input timeout: the expiry resolves to the default action and
/// the resolution is visible on the event stream.
#[tokio::test]
async fn awaiting_input_timeout_resolves_default() -> anyhow::Result<()> {
    let connector = ScriptedConnector::manual();
    let rig = GatewayRig::spawn(MemoryStore::new(), connector, &[]).await?;

    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let session_id = client.create_session().await?;
    client.subscribe(&session_id, 0).await?;
    client.collect_events_until(0, STARTUP_EVENTS).await?;

    let handle =
        rig.manager.get_session(&session_id).ok_or_else(|| anyhow::anyhow!("not resident"))?;
    handle
        .request_input("pick", vec!["A".into(), "B".into()], "A", Some(Duration::from_millis(300)))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let asked = client.recv_type("event").await?;
    assert_eq!(asked["payload"]["to"], "awaiting_input");
    assert_eq!(asked["payload"]["question"], "pick");
    assert_eq!(asked["payload"]["defaultAction"], "A");
    assert!(asked["payload"]["expiresAt"].is_string());

    let resolved = client.recv_type("event").await?;
    assert_eq!(resolved["payload"]["to"], "working");
    assert_eq!(resolved["payload"]["resolution"]["type"], "timeout");
    assert_eq!(resolved["payload"]["resolution"]["value"], "A");
    let message = resolved["payload"]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("Timeout:"), "got message {message:?}");
    Ok(())
}

/// Lease steal: while the recorded owner's lease is live this gateway
/// redirects; once it lapses the gateway claims, warms from the store, and
/// resumes the sequence exactly where the log stopped.
#[tokio::test]
async fn lease_steal_resumes_stored_sequence() -> anyhow::Result<()> {
    let store = MemoryStore::new();

    // A session owned by a gateway that froze: live lease, mid-life
    // record, thirteen events already in the log.
    let mut record = SessionRecord::new("stolen".into(), "u1".into(), "claude".into(), "/w".into());
    record.status = SessionStatus::Running;
    record.workflow_status = WorkflowStatus::Working;
    record.next_seq = 14;
    store.insert_session(&record).await?;
    store
        .try_claim_lease("stolen", "g-dead", chrono::Utc::now() + chrono::Duration::milliseconds(1200))
        .await?;
    let events: Vec<SessionEvent> = (1..=13)
        .map(|seq| {
            SessionEvent::new(seq, EventBody::output_chunk(&bytes::Bytes::from(format!("c{seq}"))))
        })
        .collect();
    store.append_events("stolen", &events).await?;

    let rig = GatewayRig::spawn(
        store,
        ScriptedConnector::manual(),
        &["--gateway-id", "g2", "--lease-timeout-ms", "2000"],
    )
    .await?;
    let mut client = Client::connect_hello(rig.addr, "c1").await?;

    // Live foreign lease: redirect with the holder's identity.
    client.send(serde_json::json!({ "type": "subscribe", "sessionId": "stolen" })).await?;
    let redirect = client.recv_type("error").await?;
    assert_eq!(redirect["code"], "ACCESS_ELSEWHERE");
    assert!(redirect["message"].as_str().unwrap_or_default().contains("g-dead"));

    // Wait out the lease, then claim and replay the stored history.
    tokio::time::sleep(Duration::from_millis(1400)).await;
    let subscribed = client.subscribe("stolen", 0).await?;
    assert_eq!(subscribed["latestSeq"].as_u64(), Some(13));
    client.collect_events_until(0, 13).await?;

    // New events resume at the stored tail, no seq reuse.
    let ack = client.input("stolen", "i-steal", "hello").await?;
    assert_eq!(ack["acceptedSeq"].as_u64(), Some(14));
    Ok(())
}

/// Duplicate input: the same `clientInputId` yields the same accepted seq
/// and only one persisted input event.
#[tokio::test]
async fn duplicate_input_is_deduplicated() -> anyhow::Result<()> {
    let connector = ScriptedConnector::manual();
    let rig = GatewayRig::spawn(MemoryStore::new(), connector, &[]).await?;

    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let session_id = client.create_session().await?;

    let first = client.input(&session_id, "X", "hi").await?;

    // Simulate a retry after reconnect.
    drop(client);
    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let second = client.input(&session_id, "X", "hi").await?;

    assert_eq!(first["acceptedSeq"], second["acceptedSeq"]);

    // Exactly one input event in the durable log.
    let mut inputs = 0;
    for _ in 0..50 {
        let events = rig.store.read_events(&session_id, 1, 1000).await?;
        inputs = events.iter().filter(|e| e.payload["clientInputId"] == "X").count();
        if inputs >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(inputs, 1);
    Ok(())
}

/// Stopping a session drains and answers `session_stopped`; a later
/// subscribe still replays the full history including the terminal
/// transitions.
#[tokio::test]
async fn stop_session_then_replay_history() -> anyhow::Result<()> {
    let connector = ScriptedConnector::manual();
    let rig = GatewayRig::spawn(MemoryStore::new(), connector, &[]).await?;

    let mut client = Client::connect_hello(rig.addr, "c1").await?;
    let session_id = client.create_session().await?;
    let controller = rig.connector.controller(0).ok_or_else(|| anyhow::anyhow!("no agent"))?;
    controller.emit(b"some output").await;
    wait_for_seq(&rig.manager, &session_id, STARTUP_EVENTS + 2).await?;

    client.send(serde_json::json!({ "type": "stop_session", "sessionId": session_id })).await?;
    let stopped = client.recv_type("session_stopped").await?;
    assert_eq!(stopped["sessionId"].as_str(), Some(session_id.as_str()));

    // stopping + stopped joined the stream after the chunk.
    let subscribed = client.subscribe(&session_id, 0).await?;
    assert_eq!(subscribed["currentState"]["status"], "stopped");
    let last = subscribed["latestSeq"].as_u64().unwrap_or(0);
    assert_eq!(last, STARTUP_EVENTS + 3);
    let events = client.collect_events_until(0, last).await?;
    assert_eq!(events.last().map(|e| e["payload"]["to"].clone()), Some("stopped".into()));
    Ok(())
}
