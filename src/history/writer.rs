//! Buffered history writer.
//!
//! Decouples decision latency from sink latency: records go onto a
//! bounded queue drained by a background task that retries failed appends
//! with exponential backoff. On queue overflow or exhausted retries the
//! record is spilled to a JSON Lines file and a backlog flag is raised;
//! the flag clears once the spill is re-ingested, and the engine surfaces
//! it as a critical anomaly on decisions made in between.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{DecisionRecord, HistorySink};
use crate::error::{Error, Result};

/// Configuration for the buffered writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Records the queue holds before overflowing to the spill file
    pub queue_capacity: usize,
    /// Append retries before a record is spilled
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries
    pub base_delay: Duration,
    /// Overflow spill destination; records are dropped (and logged) when
    /// absent
    pub spill_path: Option<PathBuf>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            spill_path: None,
        }
    }
}

/// Handle to the background drain task.
pub struct HistoryWriter {
    tx: Mutex<Option<mpsc::Sender<DecisionRecord>>>,
    backlogged: Arc<AtomicBool>,
    spill_path: Option<PathBuf>,
    spill_lock: Arc<std::sync::Mutex<()>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryWriter {
    /// Spawn the drain task for a sink.
    pub fn spawn(sink: Arc<dyn HistorySink>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let backlogged = Arc::new(AtomicBool::new(false));
        let spill_path = config.spill_path.clone();
        let spill_lock = Arc::new(std::sync::Mutex::new(()));

        let worker = Worker {
            sink,
            config,
            backlogged: Arc::clone(&backlogged),
            spill_lock: Arc::clone(&spill_lock),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx: Mutex::new(Some(tx)),
            backlogged,
            spill_path,
            spill_lock,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a record. Overflow spills the record instead of blocking
    /// the decision path.
    pub async fn append(&self, record: DecisionRecord) -> Result<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(Error::EngineClosed)?;
        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(
                    decision_id = %record.decision_id,
                    "history queue full, spilling record"
                );
                let _guard = lock_spill(&self.spill_lock);
                spill_record(self.backlogged.as_ref(), &self.spill_path, &record);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::EngineClosed),
        }
    }

    /// Whether spilled records are awaiting re-ingestion.
    pub fn is_backlogged(&self) -> bool {
        self.backlogged.load(Ordering::Acquire)
    }

    /// Stop accepting records, drain the queue, and flush the sink.
    /// Returns `false` when the drain did not finish within the deadline.
    pub async fn close(&self, deadline: Duration) -> bool {
        self.tx.lock().await.take();
        let handle = self.worker.lock().await.take();
        match handle {
            Some(handle) => tokio::time::timeout(deadline, handle).await.is_ok(),
            None => true,
        }
    }
}

fn lock_spill(lock: &std::sync::Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct Worker {
    sink: Arc<dyn HistorySink>,
    config: WriterConfig,
    backlogged: Arc<AtomicBool>,
    spill_lock: Arc<std::sync::Mutex<()>>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<DecisionRecord>) {
        while let Some(record) = rx.recv().await {
            self.deliver(record).await;
            if rx.is_empty() {
                self.drain_spill().await;
            }
        }
        self.drain_spill().await;
        if let Err(err) = self.sink.flush().await {
            error!("history sink flush failed: {}", err);
        }
    }

    async fn deliver(&self, record: DecisionRecord) {
        let mut attempt: u32 = 0;
        loop {
            match self.sink.append(&record).await {
                Ok(()) => return,
                Err(err) if attempt < self.config.max_retries => {
                    let delay = self.config.base_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        decision_id = %record.decision_id,
                        attempt,
                        "history append failed, retrying in {:?}: {}",
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        decision_id = %record.decision_id,
                        "history append failed after {} retries, spilling: {}",
                        attempt,
                        err
                    );
                    let _guard = lock_spill(&self.spill_lock);
                    spill_record(self.backlogged.as_ref(), &self.config.spill_path, &record);
                    return;
                }
            }
        }
    }

    /// Re-ingest spilled records once the live queue is idle.
    ///
    /// The spill file is claimed atomically (read + remove + flag clear
    /// under the spill lock); re-delivery failures re-spill the record,
    /// which raises the flag again.
    async fn drain_spill(&self) {
        if !self.backlogged.load(Ordering::Acquire) {
            return;
        }
        let Some(path) = &self.config.spill_path else {
            // Nothing durable to drain; the backlog resolves once the
            // sink accepts records again.
            self.backlogged.store(false, Ordering::Release);
            return;
        };

        let contents = {
            let _guard = lock_spill(&self.spill_lock);
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    if let Err(err) = std::fs::remove_file(path) {
                        debug!("spill file removal failed: {}", err);
                    }
                    self.backlogged.store(false, Ordering::Release);
                    contents
                }
                Err(_) => {
                    self.backlogged.store(false, Ordering::Release);
                    return;
                }
            }
        };

        let mut drained = 0usize;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<DecisionRecord>(line) {
                Ok(record) => {
                    if self.sink.append(&record).await.is_err() {
                        let _guard = lock_spill(&self.spill_lock);
                        spill_record(self.backlogged.as_ref(), &self.config.spill_path, &record);
                    } else {
                        drained += 1;
                    }
                }
                Err(err) => {
                    error!("dropping unparseable spilled record: {}", err);
                }
            }
        }
        if drained > 0 {
            debug!(drained, "history spill drained");
        }
    }
}

fn spill_record(backlogged: &AtomicBool, path: &Option<PathBuf>, record: &DecisionRecord) {
    backlogged.store(true, Ordering::Release);
    let Some(path) = path else {
        error!(decision_id = %record.decision_id, "no spill path configured, record dropped");
        return;
    };

    let write = || -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(file, "{}", line)
    };
    if let Err(err) = write() {
        error!(
            decision_id = %record.decision_id,
            "spill write failed, record dropped: {}",
            err
        );
    }
}
