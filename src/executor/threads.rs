//! Fixed set of dedicated OS threads for CPU bound scoring.

use crate::error::ScoringError;
use log::debug;
use parking_lot::Mutex;
use std::io;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let shared_rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);

        for id in 0..size {
            let rx = Arc::clone(&shared_rx);
            let handle = thread::Builder::new()
                .name(format!("scoring-worker-{}", id))
                .spawn(move || loop {
                    // Lock only while waiting for the next job, never while running it.
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn submit<F>(&self, job: F) -> Result<(), ScoringError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(ScoringError::PoolClosed)?;
        tx.send(Box::new(job)).map_err(|_| ScoringError::PoolClosed)
    }

    /// Stop accepting jobs and wait for workers to drain the queue.
    pub fn close(&self) {
        let sender = self.tx.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let count = workers.len();
        for handle in workers {
            let _ = handle.join();
        }
        debug!("scoring thread pool closed, {} workers joined", count);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.close();
    }
}
