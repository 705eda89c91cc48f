// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batching persistence writer.
//!
//! Many actors enqueue event records; one consumer task drains the queue
//! and writes batches through the [`EventStore`] when either the batch
//! size or the flush interval is reached. Sequence numbers are assigned
//! before enqueue, so retried batches upsert idempotently.
//!
//! Write failures are retried with bounded exponential backoff. When the
//! retry cap is exhausted the writer pauses: buffered and queued events
//! are retained, the error is surfaced through the handle, and nothing is
//! consumed until an operator calls [`PersistHandle::resume`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::event::SessionEvent;
use crate::store::EventStore;

/// Writer tuning knobs.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Flush when this many records are buffered.
    pub batch_size: usize,
    /// Flush at least this often while records are buffered.
    pub flush_interval: Duration,
    /// Attempts per batch before the writer pauses.
    pub retry_cap: u32,
    /// First retry delay; doubles per attempt, capped at 5s, jittered.
    pub base_backoff: Duration,
    /// Command queue depth shared by all producers.
    pub queue_depth: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            flush_interval: Duration::from_millis(250),
            retry_cap: 8,
            base_backoff: Duration::from_millis(100),
            queue_depth: 4096,
        }
    }
}

/// Why an enqueue was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("writer queue is full")]
    Full,
    #[error("writer has shut down")]
    Closed,
}

/// Why a drain did not complete.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer is paused after exhausting retries: {0}")]
    Paused(String),
    #[error("writer has shut down")]
    Closed,
}

enum WriterCmd {
    Event { session_id: String, event: SessionEvent },
    Drain { ack: oneshot::Sender<Result<(), String>> },
}

#[derive(Default)]
struct WriterShared {
    /// Highest persisted seq per session.
    watermarks: Mutex<HashMap<String, u64>>,
    paused: AtomicBool,
    last_error: Mutex<Option<String>>,
    resume: Notify,
}

/// Cloneable producer-side handle.
#[derive(Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<WriterCmd>,
    shared: Arc<WriterShared>,
}

impl PersistHandle {
    /// Non-blocking enqueue. Never fails for reasons other than a full
    /// queue or a stopped writer.
    pub fn enqueue(&self, session_id: &str, event: SessionEvent) -> Result<(), EnqueueError> {
        self.tx
            .try_send(WriterCmd::Event { session_id: session_id.to_owned(), event })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            })
    }

    /// Awaiting enqueue, used by the actor once `enqueue` reports a full
    /// queue — this is the backpressure path.
    pub async fn enqueue_wait(
        &self,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<(), EnqueueError> {
        self.tx
            .send(WriterCmd::Event { session_id: session_id.to_owned(), event })
            .await
            .map_err(|_| EnqueueError::Closed)
    }

    /// Flush everything currently queued and buffered, including this
    /// session's records. Returns once the store write completed.
    pub async fn drain_session(&self, _session_id: &str) -> Result<(), WriterError> {
        self.drain_all().await
    }

    /// Flush everything queued and buffered.
    ///
    /// A paused writer fails fast; a pause that lands while the drain is
    /// already queued surfaces through the bounded wait instead of
    /// blocking the caller until an operator resumes.
    pub async fn drain_all(&self) -> Result<(), WriterError> {
        if self.is_paused() {
            return Err(WriterError::Paused(self.last_error().unwrap_or_default()));
        }
        let (ack, rx) = oneshot::channel();
        self.tx.send(WriterCmd::Drain { ack }).await.map_err(|_| WriterError::Closed)?;
        match tokio::time::timeout(Duration::from_secs(5), rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(detail))) => Err(WriterError::Paused(detail)),
            Ok(Err(_)) => Err(WriterError::Closed),
            Err(_) => {
                Err(WriterError::Paused(self.last_error().unwrap_or_else(|| {
                    "drain timed out behind a stalled writer".to_owned()
                })))
            }
        }
    }

    /// Highest persisted seq for the session, 0 when none.
    pub fn persisted_seq(&self, session_id: &str) -> u64 {
        self.shared.watermarks.lock().get(session_id).copied().unwrap_or(0)
    }

    /// Seed the watermark for a session loaded from the store, so ring
    /// eviction knows its tail is already durable.
    pub fn set_watermark(&self, session_id: &str, seq: u64) {
        let mut marks = self.shared.watermarks.lock();
        let entry = marks.entry(session_id.to_owned()).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Forget the watermark for a removed session.
    pub fn clear_watermark(&self, session_id: &str) {
        self.shared.watermarks.lock().remove(session_id);
    }

    /// Whether the writer is paused after exhausting retries.
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// The structural error that paused the writer, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Operator action: leave the paused state and retry the stuck batch.
    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::AcqRel) {
            warn!("persistence writer resumed by operator");
        }
        self.shared.resume.notify_waiters();
    }
}

/// Consumer task state.
pub struct PersistWriter {
    rx: mpsc::Receiver<WriterCmd>,
    store: Arc<dyn EventStore>,
    shared: Arc<WriterShared>,
    config: WriterConfig,
    cancel: CancellationToken,
    buffer: Vec<(String, SessionEvent)>,
}

/// Start the writer task. Returns the producer handle and the join handle
/// awaited during shutdown (after cancellation the task performs a final
/// flush before exiting).
pub fn spawn(
    store: Arc<dyn EventStore>,
    config: WriterConfig,
    cancel: CancellationToken,
) -> (PersistHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.queue_depth);
    let shared = Arc::new(WriterShared::default());
    let writer = PersistWriter {
        rx,
        store,
        shared: Arc::clone(&shared),
        config,
        cancel,
        buffer: Vec::new(),
    };
    let task = tokio::spawn(writer.run());
    (PersistHandle { tx, shared }, task)
}

impl PersistWriter {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.shared.paused.load(Ordering::Acquire) {
                // Consume nothing while paused; producers back up against
                // the bounded queue. Arm the waiter before re-checking the
                // flag: notify_waiters only wakes registered waiters, so a
                // resume() landing between the check and the await would
                // otherwise be lost.
                let mut cancelled = false;
                loop {
                    let notified = self.shared.resume.notified();
                    tokio::pin!(notified);
                    // Register interest before re-checking the flag; an
                    // un-polled Notified future receives no wakeups.
                    notified.as_mut().enable();
                    if !self.shared.paused.load(Ordering::Acquire) {
                        break;
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.cancel.cancelled() => {
                            cancelled = true;
                            break;
                        }
                    }
                }
                if cancelled {
                    break;
                }
                let _ = self.flush().await;
                continue;
            }

            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(WriterCmd::Event { session_id, event }) => {
                        self.buffer.push((session_id, event));
                        if self.buffer.len() >= self.config.batch_size {
                            let _ = self.flush().await;
                        }
                    }
                    Some(WriterCmd::Drain { ack }) => {
                        let mut acks = self.absorb_queued_events();
                        acks.push(ack);
                        let result = self.flush().await;
                        for ack in acks {
                            let _ = ack.send(result.clone());
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        let _ = self.flush().await;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        // Shutdown: absorb whatever is still queued, then a final flush.
        let acks = self.absorb_queued_events();
        let result = self.flush().await;
        if let Err(ref detail) = result {
            error!("final persistence flush failed: {detail}");
        }
        for ack in acks {
            let _ = ack.send(result.clone());
        }
        debug!("persistence writer stopped");
    }

    /// Pull already-queued events out of the channel without awaiting.
    /// Pending drain acks are returned so they can be answered after the
    /// next flush.
    fn absorb_queued_events(&mut self) -> Vec<oneshot::Sender<Result<(), String>>> {
        let mut acks = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                WriterCmd::Event { session_id, event } => self.buffer.push((session_id, event)),
                WriterCmd::Drain { ack } => acks.push(ack),
            }
        }
        acks
    }

    /// Write the buffered records, grouped per session, retrying each batch
    /// with exponential backoff. On retry-cap exhaustion the writer pauses
    /// and the unwritten remainder stays buffered.
    async fn flush(&mut self) -> Result<(), String> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let mut by_session: HashMap<String, Vec<SessionEvent>> = HashMap::new();
        for (session_id, event) in self.buffer.drain(..) {
            by_session.entry(session_id).or_default().push(event);
        }

        let mut failed: Vec<(String, SessionEvent)> = Vec::new();
        let mut failure: Option<String> = None;

        for (session_id, events) in by_session {
            if failure.is_some() {
                failed.extend(events.into_iter().map(|e| (session_id.clone(), e)));
                continue;
            }
            match self.write_batch(&session_id, &events).await {
                Ok(()) => {
                    let top = events.iter().map(|e| e.seq).max().unwrap_or(0);
                    let mut marks = self.shared.watermarks.lock();
                    let entry = marks.entry(session_id).or_insert(0);
                    *entry = (*entry).max(top);
                }
                Err(detail) => {
                    failed.extend(events.into_iter().map(|e| (session_id.clone(), e)));
                    failure = Some(detail);
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(detail) => {
                // Keep the unwritten remainder for the post-resume retry.
                self.buffer = failed;
                *self.shared.last_error.lock() = Some(detail.clone());
                self.shared.paused.store(true, Ordering::Release);
                error!("persistence writer paused after retry cap: {detail}");
                Err(detail)
            }
        }
    }

    async fn write_batch(&self, session_id: &str, events: &[SessionEvent]) -> Result<(), String> {
        let mut attempt = 0u32;
        loop {
            match self.store.append_events(session_id, events).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 >= self.config.retry_cap => {
                    return Err(format!("append for {session_id} failed: {e}"));
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        session = session_id,
                        attempt, "persistence append failed, retrying in {delay:?}: {e}"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => {
                            return Err(format!("append for {session_id} cancelled mid-retry"));
                        }
                    }
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_backoff.saturating_mul(1 << attempt.min(6));
        let capped = base.min(Duration::from_secs(5));
        let jitter = rand::rng().random_range(0..=capped.as_millis() as u64 / 2);
        capped + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
