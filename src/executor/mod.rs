//! Worker pool executing blocking scoring calls off the dispatch path.
//!
//! The pool has no admission limit of its own; callers pass the circuit
//! breaker first. Each call carries a deadline: an abandoned call is reported
//! as [`ScoringError::DeadlineExceeded`] while the worker runs it to completion.

pub mod threads;

pub use crate::config::ExecutionMode;

use crate::config::ExecutorConfig;
use crate::error::ScoringError;
use crate::model::ScoringArtifact;
use crate::types::{Features, Prediction};
use log::{debug, info};
use serde::Serialize;
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::{timeout_at, Instant};

use threads::ThreadPool;

type Reply = oneshot::Receiver<Result<Prediction, ScoringError>>;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

enum Backend {
    Threads(ThreadPool),
    Blocking(Arc<Semaphore>),
}

/// Worker pool statistics for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Bounded pool of scoring workers.
pub struct WorkerPool {
    backend: Backend,
    size: usize,
    call_timeout: Duration,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: &ExecutorConfig) -> io::Result<Self> {
        let size = config.worker_pool_size.max(1);
        let backend = match config.mode {
            ExecutionMode::DedicatedThreads => Backend::Threads(ThreadPool::new(size)?),
            ExecutionMode::RuntimeBlocking => Backend::Blocking(Arc::new(Semaphore::new(size))),
        };
        info!(
            "worker pool started: {} workers ({:?}), deadline {:?}",
            size,
            config.mode,
            config.call_timeout()
        );

        Ok(Self {
            backend,
            size,
            call_timeout: config.call_timeout(),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    /// Score one feature map. Safe to call concurrently from many tasks.
    pub async fn run(
        &self,
        model: Arc<dyn ScoringArtifact>,
        features: Features,
    ) -> Result<Prediction, ScoringError> {
        let _in_flight = InFlight::enter(&self.in_flight, 1);
        let deadline = deadline_after(self.call_timeout);
        let reply = self.submit(model, features)?;
        self.await_reply(reply, deadline).await
    }

    /// Score every item as an independent submission; output order matches input order.
    pub async fn run_batch(
        &self,
        model: Arc<dyn ScoringArtifact>,
        batch: Vec<Features>,
    ) -> Vec<Result<Prediction, ScoringError>> {
        let _in_flight = InFlight::enter(&self.in_flight, batch.len());
        let deadline = deadline_after(self.call_timeout);

        let replies: Vec<_> = batch
            .into_iter()
            .map(|features| self.submit(Arc::clone(&model), features))
            .collect();

        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            let result = match reply {
                Ok(rx) => self.await_reply(rx, deadline).await,
                Err(e) => Err(e),
            };
            results.push(result);
        }
        results
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            in_flight: self.in_flight(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work. Dedicated threads finish queued jobs before exiting.
    pub fn close(&self) {
        match &self.backend {
            Backend::Threads(pool) => pool.close(),
            Backend::Blocking(permits) => permits.close(),
        }
        debug!("worker pool closed");
    }

    fn submit(
        &self,
        model: Arc<dyn ScoringArtifact>,
        features: Features,
    ) -> Result<Reply, ScoringError> {
        let (tx, rx) = oneshot::channel();
        match &self.backend {
            Backend::Threads(pool) => {
                pool.submit(move || {
                    let _ = tx.send(score_guarded(model.as_ref(), &features));
                })?;
            }
            Backend::Blocking(permits) => {
                if permits.is_closed() {
                    return Err(ScoringError::PoolClosed);
                }
                let permits = Arc::clone(permits);
                tokio::spawn(async move {
                    let permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            let _ = tx.send(Err(ScoringError::PoolClosed));
                            return;
                        }
                    };
                    let result = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        score_guarded(model.as_ref(), &features)
                    })
                    .await
                    .unwrap_or(Err(ScoringError::WorkerLost));
                    let _ = tx.send(result);
                });
            }
        }
        Ok(rx)
    }

    async fn await_reply(&self, rx: Reply, deadline: Instant) -> Result<Prediction, ScoringError> {
        let result = match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ScoringError::WorkerLost),
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(ScoringError::DeadlineExceeded(self.call_timeout))
            }
        };

        match &result {
            Ok(_) => self.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Backend::Blocking(permits) = &self.backend {
            permits.close();
        }
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Run the artifact, turning a panic into a scoring error so the worker survives.
fn score_guarded(model: &dyn ScoringArtifact, features: &Features) -> Result<Prediction, ScoringError> {
    panic::catch_unwind(AssertUnwindSafe(|| model.score(features)))
        .unwrap_or_else(|payload| Err(ScoringError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
    n: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, n: usize) -> Self {
        counter.fetch_add(n, Ordering::AcqRel);
        Self { counter, n }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.n, Ordering::AcqRel);
    }
}
