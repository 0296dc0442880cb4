//! Background encoder queue
//!
//! Successful event appends hand their command text to a bounded queue; a
//! dedicated encoder thread drains it, encodes with the live model and
//! stages the vector in the ANN index. The request path never blocks on
//! encoding, and a full queue drops work instead of applying backpressure
//! to `log` handlers.
//!
//! # Architecture
//!
//! ```text
//! log handler ──try_send──→ bounded sync_channel ──→ encoder thread
//!                                                        │
//!                                          model.read() encode
//!                                                        │
//!                                          ann.write().add(vector, meta)
//! ```

use crate::ann::{AnnIndex, ItemMeta};
use crate::embedding::SkipgramModel;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queue capacity; jobs beyond it are dropped (and counted).
pub const QUEUE_CAPACITY: usize = 4_096;

/// Longest command text fed to the encoder.
const MAX_ENCODE_BYTES: usize = 8 * 1024;

/// One encode job: the event to represent and its command text.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub event_id: i64,
    pub fingerprint: String,
    pub command: String,
    pub insert_ts_ns: i64,
}

enum QueueCommand {
    Encode(Box<EncodeJob>),
    Shutdown,
}

/// Counters for status reporting.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub encoded: AtomicU64,
    pub dropped: AtomicU64,
    pub skipped_no_model: AtomicU64,
    /// Wall-clock ns of the most recent staged addition; 0 when none yet.
    pub last_add_ns: AtomicI64,
}

/// Handle to the encoder thread.
pub struct EmbedQueue {
    tx: SyncSender<QueueCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<QueueMetrics>,
}

impl EmbedQueue {
    /// Spawn the encoder thread against the shared model and index.
    pub fn start(
        model: Arc<RwLock<Option<SkipgramModel>>>,
        ann: Arc<RwLock<AnnIndex>>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<QueueCommand>(QUEUE_CAPACITY);
        let metrics = Arc::new(QueueMetrics::default());
        let thread_metrics = metrics.clone();

        let handle = thread::Builder::new()
            .name("embed-encoder".into())
            .spawn(move || {
                encoder_thread(rx, model, ann, thread_metrics);
            })?;

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
            metrics,
        })
    }

    /// Submit a job; returns false when the queue is full and the job was
    /// dropped.
    pub fn submit(&self, job: EncodeJob) -> bool {
        match self.tx.try_send(QueueCommand::Encode(Box::new(job))) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Embedding queue full, dropping job");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    #[allow(dead_code)] // counter snapshot for tests and debugging
    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Nanoseconds since the most recent staged addition, if any.
    pub fn ns_since_last_add(&self) -> Option<i64> {
        let last = self.metrics.last_add_ns.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some(crate::util::now_ns().saturating_sub(last))
    }

    /// Drain queued jobs and stop the encoder thread. The shutdown marker
    /// queues behind pending work, so everything submitted before this
    /// call still gets encoded.
    pub fn shutdown(&self, wait: Duration) -> anyhow::Result<()> {
        let _ = self.tx.send(QueueCommand::Shutdown);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let deadline = std::time::Instant::now() + wait;
            while !handle.is_finished() {
                if std::time::Instant::now() >= deadline {
                    tracing::warn!("Encoder thread did not drain within {:?}", wait);
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(20));
            }
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for EmbedQueue {
    fn drop(&mut self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn encoder_thread(
    rx: mpsc::Receiver<QueueCommand>,
    model: Arc<RwLock<Option<SkipgramModel>>>,
    ann: Arc<RwLock<AnnIndex>>,
    metrics: Arc<QueueMetrics>,
) {
    while let Ok(command) = rx.recv() {
        match command {
            QueueCommand::Encode(job) => {
                // bound encode cost for pathological command lines
                let text = crate::util::clip_to_char_boundary(&job.command, MAX_ENCODE_BYTES);
                let vector = {
                    let guard = model.read().unwrap_or_else(|e| e.into_inner());
                    match guard.as_ref() {
                        Some(model) => model.encode(text),
                        None => {
                            metrics.skipped_no_model.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    }
                };
                if vector.iter().all(|x| *x == 0.0) {
                    // nothing to index for an all-separator command
                    continue;
                }

                let meta = ItemMeta {
                    fingerprint: job.fingerprint,
                    command_ref: job.event_id,
                    insert_ts_ns: job.insert_ts_ns,
                };
                let result = {
                    let mut guard = ann.write().unwrap_or_else(|e| e.into_inner());
                    guard.add(vector, meta)
                };
                match result {
                    Ok(()) => {
                        metrics.encoded.fetch_add(1, Ordering::Relaxed);
                        metrics
                            .last_add_ns
                            .store(crate::util::now_ns(), Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to stage embedding: {}", e);
                    }
                }
            }
            QueueCommand::Shutdown => break,
        }
    }
    tracing::debug!("Encoder thread shutting down");
}
