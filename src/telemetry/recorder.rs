//! # Prediction Recorder
//!
//! Sampled recording of prediction outcomes. Counting and sampling happen on
//! the caller's thread; file writes, rotation and compression run on a
//! dedicated writer thread fed by a bounded queue. A full queue drops the
//! event rather than stalling the request.

use super::writer::{PredictLogConfig, PredictLogWriter};
use crate::config::TelemetryConfig;
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// How a prediction request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Ok,
    /// Refused by admission control
    Rejected,
    /// Model error, timeout or worker failure
    Failed,
}

/// One line of the prediction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionEvent {
    pub request_id: String,
    pub timestamp_ms: u64,
    pub model_version: String,
    pub cache_hit: bool,
    pub latency_us: u64,
    pub outcome: EventOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Recorder counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecorderStats {
    /// Every event offered to the recorder, sampled or not
    pub total: u64,
    /// Events written to the log
    pub recorded: u64,
    pub cache_hits: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Sampled events lost to a full queue
    pub dropped: u64,
}

impl RecorderStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total as f64
        }
    }
}

enum Command {
    Write(PredictionEvent),
    Flush(SyncSender<io::Result<()>>),
}

pub struct PredictionRecorder {
    sample_rate: f64,
    writer: Arc<PredictLogWriter>,
    tx: Option<SyncSender<Command>>,
    worker: Option<JoinHandle<()>>,
    total: AtomicU64,
    recorded: Arc<AtomicU64>,
    cache_hits: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl PredictionRecorder {
    pub fn new(config: &TelemetryConfig) -> io::Result<Self> {
        let writer = PredictLogWriter::new(PredictLogConfig::from_telemetry_config(config))?;
        Self::with_writer(writer, config.sample_rate, config.queue_capacity)
    }

    /// Start the writer thread over `writer`.
    pub fn with_writer(
        writer: PredictLogWriter,
        sample_rate: f64,
        queue_capacity: usize,
    ) -> io::Result<Self> {
        let writer = Arc::new(writer);
        let recorded = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::sync_channel(queue_capacity.max(1));

        let worker = {
            let writer = Arc::clone(&writer);
            let recorded = Arc::clone(&recorded);
            thread::Builder::new()
                .name("prediction-log-writer".to_string())
                .spawn(move || run_writer(rx, &writer, &recorded))?
        };

        Ok(PredictionRecorder {
            sample_rate: sample_rate.clamp(0.0, 1.0),
            writer,
            tx: Some(tx),
            worker: Some(worker),
            total: AtomicU64::new(0),
            recorded,
            cache_hits: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Fresh request id for an incoming prediction.
    pub fn next_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Count the event and, if sampled, queue it for the writer thread.
    ///
    /// Never blocks: a full queue drops the event. Write failures are logged
    /// by the writer thread.
    pub fn record(&self, event: PredictionEvent) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if event.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        match event.outcome {
            EventOutcome::Rejected => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
            EventOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            EventOutcome::Ok => {}
        }

        if !self.should_sample() {
            return;
        }

        let tx = match &self.tx {
            Some(tx) => tx,
            None => return,
        };
        match tx.try_send(Command::Write(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Command::Write(event))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("prediction log queue full, dropped {}", event.request_id);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn should_sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.sample_rate
    }

    /// Block until every event queued so far is written and flushed.
    pub fn flush(&self) -> io::Result<()> {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return self.writer.flush(),
        };
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        tx.send(Command::Flush(ack_tx)).map_err(|_| writer_gone())?;
        ack_rx.recv().map_err(|_| writer_gone())?
    }

    pub fn writer(&self) -> &PredictLogWriter {
        &self.writer
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            total: self.total.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PredictionRecorder {
    fn drop(&mut self) {
        // Closing the queue lets the writer drain what is left and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("prediction log writer thread panicked");
            }
        }
    }
}

fn run_writer(rx: Receiver<Command>, writer: &PredictLogWriter, recorded: &AtomicU64) {
    for command in rx {
        match command {
            Command::Write(event) => match writer.write_event(&event) {
                Ok(()) => {
                    recorded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("failed to write prediction event {}: {}", event.request_id, e),
            },
            Command::Flush(ack) => {
                let _ = ack.send(writer.flush());
            }
        }
    }
    if let Err(e) = writer.flush() {
        warn!("failed to flush prediction log on shutdown: {}", e);
    }
    debug!("prediction log writer stopped");
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "prediction log writer stopped")
}
