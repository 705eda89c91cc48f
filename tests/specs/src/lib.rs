// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end gateway scenarios.
//!
//! Spawns in-process gateways over a shared in-memory store and exercises
//! them through the real WebSocket protocol with a raw tungstenite client.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use perch::config::Config;
use perch::manager::SessionManager;
use perch::run::{self, Deps};
use perch::store::MemoryStore;
use perch::test_support::ScriptedConnector;
use perch::transport::StaticTokenValidator;

/// One running gateway bound to an ephemeral port.
pub struct GatewayRig {
    pub addr: std::net::SocketAddr,
    pub manager: Arc<SessionManager>,
    pub shutdown: CancellationToken,
    pub connector: Arc<ScriptedConnector>,
    pub store: Arc<MemoryStore>,
}

impl GatewayRig {
    /// Spawn a gateway on `store` with extra CLI args appended to sane test
    /// defaults.
    pub async fn spawn(
        store: Arc<MemoryStore>,
        connector: Arc<ScriptedConnector>,
        extra_args: &[&str],
    ) -> anyhow::Result<Self> {
        let mut args = vec![
            "perch",
            "--host",
            "127.0.0.1",
            "--port",
            "0",
            "--heartbeat-ms",
            "60000",
            "--idle-after",
            "0",
        ];
        args.extend_from_slice(extra_args);
        let config = <Config as clap::Parser>::try_parse_from(args)?;

        let deps = Deps {
            session_store: store.clone(),
            event_store: store.clone(),
            validator: Arc::new(StaticTokenValidator::new(None, "u1")),
            connector: connector.clone(),
        };
        let gateway = run::prepare(config, deps).await?;
        let addr = gateway.local_addr()?;
        let manager = Arc::clone(&gateway.manager);
        let shutdown = gateway.shutdown.clone();
        tokio::spawn(gateway.serve());

        Ok(Self { addr, manager, shutdown, connector, store })
    }
}

impl Drop for GatewayRig {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Thin JSON-frame client over tungstenite.
pub struct Client {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl Client {
    pub async fn connect(addr: std::net::SocketAddr) -> anyhow::Result<Self> {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await?;
        Ok(Self { ws })
    }

    /// Connect and complete the `hello` handshake.
    pub async fn connect_hello(
        addr: std::net::SocketAddr,
        client_id: &str,
    ) -> anyhow::Result<Self> {
        let mut client = Self::connect(addr).await?;
        client
            .send(serde_json::json!({
                "type": "hello", "clientId": client_id, "deviceType": "test", "token": ""
            }))
            .await?;
        let reply = client.recv().await?;
        anyhow::ensure!(reply["type"] == "hello_ok", "handshake failed: {reply}");
        Ok(client)
    }

    pub async fn send(&mut self, frame: serde_json::Value) -> anyhow::Result<()> {
        self.ws.send(WsMessage::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Next text frame as JSON, skipping non-text frames.
    pub async fn recv(&mut self) -> anyhow::Result<serde_json::Value> {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for frame"))?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            if let WsMessage::Text(text) = msg {
                return Ok(serde_json::from_str(&text)?);
            }
        }
    }

    /// Next frame of the given type, skipping `pong`s and unrelated frames.
    pub async fn recv_type(&mut self, frame_type: &str) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "no {frame_type} frame in time"
            );
            let frame = self.recv().await?;
            if frame["type"] == frame_type {
                return Ok(frame);
            }
        }
    }

    /// Read frames until the connection closes, returning everything seen.
    pub async fn drain_to_close(mut self) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), self.ws.next()).await;
            match next {
                Ok(Some(Ok(WsMessage::Text(text)))) => {
                    if let Ok(json) = serde_json::from_str(&text) {
                        frames.push(json);
                    }
                }
                Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => break,
                Ok(Some(Ok(_))) => {}
            }
        }
        frames
    }

    /// Create a session and return its id.
    pub async fn create_session(&mut self) -> anyhow::Result<String> {
        self.send(serde_json::json!({
            "type": "create_session", "agentType": "claude", "workingDirectory": "/w"
        }))
        .await?;
        let created = self.recv_type("session_created").await?;
        Ok(created["sessionId"].as_str().unwrap_or_default().to_owned())
    }

    /// Subscribe and return the `subscribed` frame.
    pub async fn subscribe(
        &mut self,
        session_id: &str,
        last_ack_seq: u64,
    ) -> anyhow::Result<serde_json::Value> {
        self.send(serde_json::json!({
            "type": "subscribe", "sessionId": session_id, "lastAckSeq": last_ack_seq
        }))
        .await?;
        self.recv_type("subscribed").await
    }

    /// Collect `event` frames until `last_seq` is seen; asserts ascending
    /// contiguous seqs starting right after `after`.
    pub async fn collect_events_until(
        &mut self,
        after: u64,
        last_seq: u64,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let mut events = Vec::new();
        let mut expect = after + 1;
        while expect <= last_seq {
            let frame = self.recv_type("event").await?;
            let seq = frame["seq"].as_u64().unwrap_or(0);
            anyhow::ensure!(seq == expect, "expected seq {expect}, got {seq}");
            events.push(frame);
            expect += 1;
        }
        Ok(events)
    }

    pub async fn ack(&mut self, session_id: &str, seq: u64) -> anyhow::Result<()> {
        self.send(serde_json::json!({ "type": "ack", "sessionId": session_id, "seq": seq })).await
    }

    pub async fn input(
        &mut self,
        session_id: &str,
        client_input_id: &str,
        data: &str,
    ) -> anyhow::Result<serde_json::Value> {
        self.send(serde_json::json!({
            "type": "input", "sessionId": session_id,
            "clientInputId": client_input_id, "data": data
        }))
        .await?;
        self.recv_type("input_ack").await
    }
}

/// Sequence numbers the gateway assigns before any payload event: the
/// provisioning→starting, starting→running, and started→working state
/// events of a fresh session.
pub const STARTUP_EVENTS: u64 = 3;
