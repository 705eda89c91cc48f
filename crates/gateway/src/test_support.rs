// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test doubles for unit tests and the end-to-end spec suite.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::agent::{AgentBackend, AgentConnector, AgentExit};
use crate::store::SessionRecord;

/// Drives one scripted agent stream from a test: push output chunks, read
/// back what the session wrote, close the stream with a chosen exit.
pub struct AgentController {
    out_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    inputs: Arc<Mutex<Vec<Bytes>>>,
    exit: Arc<Mutex<AgentExit>>,
}

impl AgentController {
    /// Emit an output chunk from the fake agent.
    pub async fn emit(&self, data: &[u8]) {
        let tx = self.out_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(Bytes::copy_from_slice(data)).await;
        }
    }

    /// Everything the session has written to the agent so far.
    pub fn inputs(&self) -> Vec<Bytes> {
        self.inputs.lock().clone()
    }

    /// Close the agent side with the given exit status.
    pub fn close(&self, exit: AgentExit) {
        *self.exit.lock() = exit;
        self.out_tx.lock().take();
    }
}

enum Mode {
    /// Output is driven manually through the [`AgentController`].
    Manual,
    /// Every input chunk is echoed back as output.
    Echo,
    /// Output is driven manually and input is never consumed, so the
    /// session's outbound buffer fills up.
    Stalled,
}

/// [`AgentConnector`] double. Each `connect` produces a scripted backend
/// and records a controller retrievable via [`ScriptedConnector::controller`].
pub struct ScriptedConnector {
    mode: Mode,
    fail_connects: AtomicU32,
    controllers: Mutex<Vec<Arc<AgentController>>>,
}

impl ScriptedConnector {
    /// Manually-driven agent streams.
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Manual,
            fail_connects: AtomicU32::new(0),
            controllers: Mutex::new(Vec::new()),
        })
    }

    /// Echoing agent streams.
    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Echo,
            fail_connects: AtomicU32::new(0),
            controllers: Mutex::new(Vec::new()),
        })
    }

    /// Agent streams that never read their input.
    pub fn stalled() -> Arc<Self> {
        Arc::new(Self {
            mode: Mode::Stalled,
            fail_connects: AtomicU32::new(0),
            controllers: Mutex::new(Vec::new()),
        })
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_connects.store(n, Ordering::Release);
    }

    /// Controller for the `index`-th connect (0-based).
    pub fn controller(&self, index: usize) -> Option<Arc<AgentController>> {
        self.controllers.lock().get(index).cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.controllers.lock().len()
    }
}

#[async_trait::async_trait]
impl AgentConnector for ScriptedConnector {
    async fn connect(&self, _record: &SessionRecord) -> anyhow::Result<Box<dyn AgentBackend>> {
        let left = self.fail_connects.load(Ordering::Acquire);
        if left > 0 {
            self.fail_connects.store(left - 1, Ordering::Release);
            anyhow::bail!("scripted connect failure");
        }

        let (out_tx, out_rx) = mpsc::channel(1024);
        let inputs = Arc::new(Mutex::new(Vec::new()));
        let exit = Arc::new(Mutex::new(AgentExit { code: Some(0), signal: None }));
        let controller = Arc::new(AgentController {
            out_tx: Mutex::new(Some(out_tx)),
            inputs: Arc::clone(&inputs),
            exit: Arc::clone(&exit),
        });
        self.controllers.lock().push(controller);

        Ok(Box::new(ScriptedAgent {
            echo: matches!(self.mode, Mode::Echo),
            consume_input: !matches!(self.mode, Mode::Stalled),
            out_rx,
            inputs,
            exit,
        }))
    }
}

struct ScriptedAgent {
    echo: bool,
    consume_input: bool,
    out_rx: mpsc::Receiver<Bytes>,
    inputs: Arc<Mutex<Vec<Bytes>>>,
    exit: Arc<Mutex<AgentExit>>,
}

#[async_trait::async_trait]
impl AgentBackend for ScriptedAgent {
    async fn run(
        mut self: Box<Self>,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
    ) -> anyhow::Result<AgentExit> {
        loop {
            if !self.consume_input {
                // Stalled mode: input backs up in the channel untouched.
                match self.out_rx.recv().await {
                    Some(bytes) => {
                        if output_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
                continue;
            }

            tokio::select! {
                chunk = self.out_rx.recv() => match chunk {
                    Some(bytes) => {
                        if output_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    // Controller closed the agent side.
                    None => break,
                },
                input = input_rx.recv() => match input {
                    Some(bytes) => {
                        self.inputs.lock().push(bytes.clone());
                        if self.echo && output_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    // Session dropped the input side.
                    None => break,
                },
            }
        }
        let exit = *self.exit.lock();
        Ok(exit)
    }
}
