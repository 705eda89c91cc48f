// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent duplex-stream abstraction.
//!
//! The core never interprets agent semantics: a backend is an opaque byte
//! stream that produces output chunks and consumes input bytes. Output is
//! delivered through a bounded channel; when the actor's inbox fills, the
//! reader stops pulling and the agent process stalls behind its own
//! socket buffers, which is the correct outcome for a runaway producer.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::store::SessionRecord;

/// How an agent stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl AgentExit {
    pub fn clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// A connected agent duplex stream.
#[async_trait::async_trait]
pub trait AgentBackend: Send {
    /// Pump the stream: forward agent output into `output_tx`, write
    /// everything from `input_rx` to the agent. Returns when the agent
    /// side closes or `input_rx` is dropped.
    async fn run(
        self: Box<Self>,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<AgentExit>;
}

/// Connects sessions to their agent endpoint. Injected so deployments can
/// route to per-user sandbox containers; the default implementation dials
/// a TCP endpoint.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, record: &SessionRecord) -> anyhow::Result<Box<dyn AgentBackend>>;
}

// -- TCP implementation --------------------------------------------------------

/// Dials a fixed `host:port` agent endpoint.
pub struct TcpConnector {
    endpoint: String,
}

impl TcpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { endpoint: endpoint.into() }
    }
}

#[async_trait::async_trait]
impl AgentConnector for TcpConnector {
    async fn connect(&self, _record: &SessionRecord) -> anyhow::Result<Box<dyn AgentBackend>> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        Ok(Box::new(TcpAgent { stream }))
    }
}

/// Agent backend over a connected TCP stream.
pub struct TcpAgent {
    stream: TcpStream,
}

const READ_CHUNK: usize = 8192;

#[async_trait::async_trait]
impl AgentBackend for TcpAgent {
    async fn run(
        self: Box<Self>,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<AgentExit> {
        let (mut reader, mut writer) = self.stream.into_split();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            // A full inbox blocks here, stalling the agent.
                            if output_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("agent read error: {e}");
                            return Ok(AgentExit { code: Some(1), signal: None });
                        }
                    }
                }
                input = input_rx.recv() => {
                    match input {
                        Some(bytes) => {
                            if writer.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        // Actor dropped the input side: shut down our half
                        // and drain remaining output.
                        None => {
                            let _ = writer.shutdown().await;
                            drain_output(&mut reader, &output_tx, &mut buf).await;
                            break;
                        }
                    }
                }
            }
        }

        Ok(AgentExit { code: Some(0), signal: None })
    }
}

/// Read until EOF, forwarding to the actor, after the input side closed.
async fn drain_output(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    output_tx: &mpsc::Sender<Bytes>,
    buf: &mut [u8],
) {
    loop {
        match reader.read(buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if output_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
