// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Property-style checks: random interleavings of input, output, attach,
//! detach, and ack must preserve the ordering guarantees, and repeated
//! lease steals must never reuse or skip a sequence number.

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;

use perch::persist::{self, WriterConfig};
use perch::session::subscriber::MpscSink;
use perch::session::{spawn_actor, ActorConfig, SessionHandle};
use perch::store::{EventStore, MemoryStore, SessionRecord, SessionStore};
use perch::test_support::ScriptedConnector;

#[derive(Debug, Clone)]
enum Op {
    Input(u8),
    Chunk(u8),
    Attach(u8),
    Detach(u8),
    Ack(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4u8).prop_map(Op::Input),
        (0..4u8).prop_map(Op::Chunk),
        (0..3u8).prop_map(Op::Attach),
        (0..3u8).prop_map(Op::Detach),
        (0..3u8).prop_map(Op::Ack),
    ]
}

struct Attachment {
    rx: tokio::sync::mpsc::Receiver<perch::protocol::ServerMessage>,
    /// Seqs seen by this attachment: replayed backlog, then live frames.
    seqs: Vec<u64>,
}

fn frame_seq(msg: &perch::protocol::ServerMessage) -> Option<u64> {
    match msg {
        perch::protocol::ServerMessage::Event { event, .. } => Some(event.seq),
        _ => None,
    }
}

async fn run_interleaving(ops: Vec<Op>) -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let record = SessionRecord::new("p1".into(), "u1".into(), "claude".into(), "/w".into());
    store.insert_session(&record).await?;
    store
        .try_claim_lease("p1", "gw-prop", chrono::Utc::now() + chrono::Duration::seconds(60))
        .await?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let (writer, _writer_task) = persist::spawn(
        store.clone(),
        WriterConfig { flush_interval: Duration::from_millis(10), ..WriterConfig::default() },
        cancel.clone(),
    );
    let connector = ScriptedConnector::manual();
    let config = ActorConfig {
        gateway_id: "gw-prop".into(),
        idle_after: Duration::ZERO,
        ..ActorConfig::default()
    };
    let (handle, _task) = spawn_actor(
        record,
        config,
        store.clone(),
        store.clone(),
        writer.clone(),
        connector.clone(),
    );
    let controller =
        connector.controller(0).ok_or_else(|| anyhow::anyhow!("agent not connected"))?;

    let mut live: HashMap<u8, Attachment> = HashMap::new();
    let mut finished: Vec<Attachment> = Vec::new();
    let mut acked: HashMap<u8, u64> = HashMap::new();
    let mut input_counter = 0u64;
    let mut expected_events = 3u64; // startup state events

    for op in ops {
        match op {
            Op::Input(i) => {
                input_counter += 1;
                let id = format!("in-{i}-{input_counter}");
                handle.input(&format!("data-{i}"), &id).await.map_err(|e| anyhow::anyhow!("{e}"))?;
                expected_events += 1;
            }
            Op::Chunk(i) => {
                controller.emit(format!("chunk-{i}").as_bytes()).await;
                expected_events += 1;
            }
            Op::Attach(k) => {
                let (sink, rx, _reason) = MpscSink::channel(4096);
                let last_ack = acked.get(&k).copied().unwrap_or(0);
                let reply = handle
                    .attach(&format!("c{k}"), "test", last_ack, Box::new(sink))
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                let attachment =
                    Attachment { rx, seqs: reply.missed.iter().map(|e| e.seq).collect() };
                // Replay must cover (last_ack, latest] without gaps.
                let mut expect = last_ack + 1;
                for seq in &attachment.seqs {
                    anyhow::ensure!(*seq == expect, "replay gap: expected {expect}, got {seq}");
                    expect += 1;
                }
                anyhow::ensure!(expect == reply.latest_seq + 1, "replay stopped short");
                if let Some(old) = live.insert(k, attachment) {
                    finished.push(old);
                }
            }
            Op::Detach(k) => {
                handle.detach(&format!("c{k}")).await;
                if let Some(old) = live.remove(&k) {
                    finished.push(old);
                }
            }
            Op::Ack(k) => {
                if live.contains_key(&k) {
                    // Cap at the latest assigned seq so a replayed attach
                    // never starts past the tail.
                    let latest = handle.info().await.map(|i| i.next_seq - 1).unwrap_or(0);
                    let next = (acked.get(&k).copied().unwrap_or(0) + 1).min(latest);
                    if next > 0 {
                        handle.ack(&format!("c{k}"), next).await;
                        acked.insert(k, next.max(acked.get(&k).copied().unwrap_or(0)));
                    }
                }
            }
        }
    }

    // Settle: every chunk lands, then everything reaches the store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let next = handle.info().await.map(|i| i.next_seq).unwrap_or(0);
        if next == expected_events + 1 {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "events never settled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    writer.drain_all().await?;

    // Property 1: dense unique sequence in the durable log.
    let stored = store.read_events("p1", 1, 10_000).await?;
    let seqs: Vec<u64> = stored.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=expected_events).collect();
    anyhow::ensure!(seqs == expected, "store not dense: {seqs:?}");

    // Property 2: every attachment saw strictly ascending seqs.
    for (_, attachment) in live.drain() {
        finished.push(attachment);
    }
    for mut attachment in finished {
        while let Ok(msg) = attachment.rx.try_recv() {
            if let Some(seq) = frame_seq(&msg) {
                attachment.seqs.push(seq);
            }
        }
        for pair in attachment.seqs.windows(2) {
            anyhow::ensure!(pair[0] < pair[1], "out of order: {:?}", attachment.seqs);
        }
    }

    cancel.cancel();
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn random_interleavings_preserve_ordering(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        rt.block_on(run_interleaving(ops))
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
    }
}

/// Repeated lease steals across gateways: each claimant resumes exactly at
/// the stored tail, and the final log is dense with no reused seq.
#[tokio::test]
async fn repeated_lease_steals_keep_sequence_dense() -> anyhow::Result<()> {
    let store = MemoryStore::new();

    let mut record = SessionRecord::new("s1".into(), "u1".into(), "claude".into(), "/w".into());
    record.status = perch::session::lifecycle::SessionStatus::Running;
    record.workflow_status = perch::session::workflow::WorkflowStatus::Working;
    store.insert_session(&record).await?;

    let mut expected_next = 1u64;
    for round in 0..3u32 {
        let gateway = format!("g{round}");
        // The previous owner froze; its lease has already lapsed.
        store
            .try_claim_lease("s1", &gateway, chrono::Utc::now() + chrono::Duration::seconds(60))
            .await?;

        let cancel = tokio_util::sync::CancellationToken::new();
        let (writer, _task) = persist::spawn(
            store.clone(),
            WriterConfig { flush_interval: Duration::from_millis(10), ..WriterConfig::default() },
            cancel.clone(),
        );
        let connector = ScriptedConnector::manual();
        let config = ActorConfig { gateway_id: gateway.clone(), ..ActorConfig::default() };

        let mut loaded =
            store.get_session("s1").await?.ok_or_else(|| anyhow::anyhow!("missing"))?;
        let latest = store.latest_seq("s1").await?;
        loaded.next_seq = loaded.next_seq.max(latest + 1);
        writer.set_watermark("s1", latest);

        let (handle, task) = spawn_actor(
            loaded,
            config,
            store.clone(),
            store.clone(),
            writer.clone(),
            connector,
        );
        seq_matches(&handle, expected_next).await?;

        for i in 0..5 {
            let seq = handle
                .input(&format!("r{round}-{i}"), &format!("id-{round}-{i}"))
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            anyhow::ensure!(seq == expected_next, "seq reuse or skip at {seq}");
            expected_next += 1;
        }

        writer.drain_all().await?;
        // Freeze this gateway: halt the actor without graceful stop.
        handle.lease_lost().await;
        let _ = task.await;
        store.release_lease("s1", &gateway).await?;
        cancel.cancel();
    }

    let stored = store.read_events("s1", 1, 10_000).await?;
    let seqs: Vec<u64> = stored.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=expected_next - 1).collect();
    assert_eq!(seqs, expected);
    Ok(())
}

async fn seq_matches(handle: &SessionHandle, expected: u64) -> anyhow::Result<()> {
    let info = handle.info().await.ok_or_else(|| anyhow::anyhow!("no info"))?;
    anyhow::ensure!(info.next_seq == expected, "loaded at {} not {expected}", info.next_seq);
    Ok(())
}
