//! Background job system
//!
//! A fixed pool of worker threads pulls boxed jobs from a `crossbeam-channel`
//! queue. Every spawned job gets a [`CancellationToken`] and returns its
//! result through a [`JobHandle`], which is the join point for the caller.
//!
//! The renderer keeps three systems: a shared pool for scene loads, and one
//! single-thread system each for light-culling issuance and promotion copy
//! cycles. A slow load can occupy every pool worker without delaying the
//! frame's culling submission.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job '{0}' panicked")]
    Panicked(String),
    #[error("job '{0}' was dropped before completing")]
    Disconnected(String),
    #[error("job '{name}' did not finish within {timeout:?}")]
    TimedOut { name: String, timeout: Duration },
    #[error("job system is shut down")]
    ShutDown,
}

/// Cooperative cancellation flag shared between a job and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Join point for a spawned job.
///
/// Dropping the handle detaches the job; it still runs to completion.
pub struct JobHandle<T> {
    name: String,
    token: CancellationToken,
    result: Receiver<std::thread::Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the job to stop at its next cancellation check.
    pub fn cancel(&self) {
        log::debug!("cancelling job '{}'", self.name);
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        !self.result.is_empty()
    }

    /// Take the result if the job has finished.
    pub fn try_join(&self) -> Option<Result<T, JobError>> {
        match self.result.try_recv() {
            Ok(result) => Some(self.unwrap_result(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(JobError::Disconnected(self.name.clone())))
            }
        }
    }

    /// Block until the job finishes.
    pub fn join(self) -> Result<T, JobError> {
        match self.result.recv() {
            Ok(result) => self.unwrap_result(result),
            Err(_) => Err(JobError::Disconnected(self.name.clone())),
        }
    }

    /// Block until the job finishes or `timeout` elapses.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, JobError> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => self.unwrap_result(result),
            Err(RecvTimeoutError::Timeout) => Err(JobError::TimedOut {
                name: self.name.clone(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(JobError::Disconnected(self.name.clone())),
        }
    }

    fn unwrap_result(&self, result: std::thread::Result<T>) -> Result<T, JobError> {
        result.map_err(|_| {
            log::error!("job '{}' panicked", self.name);
            JobError::Panicked(self.name.clone())
        })
    }
}

/// Fixed-size worker pool
pub struct JobSystem {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobSystem {
    /// Start `worker_count` workers (at least one).
    pub fn new(worker_count: usize) -> Self {
        Self::named("render-worker", worker_count)
    }

    /// Start `worker_count` workers whose threads are named `{name}-{index}`.
    pub fn named(name: &str, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let workers = (0..worker_count)
            .filter_map(|index| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .map_err(|e| log::error!("failed to start worker {}: {}", index, e))
                    .ok()
            })
            .collect::<Vec<_>>();
        log::debug!("job system '{}' started with {} workers", name, workers.len());
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. It receives its own cancellation token.
    pub fn spawn<T, F>(&self, name: &str, job: F) -> Result<JobHandle<T>, JobError>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(JobError::ShutDown)?;
        let token = CancellationToken::new();
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        let job_token = token.clone();
        let job_name = name.to_string();
        let boxed: Job = Box::new(move || {
            log::trace!("job '{}' started", job_name);
            let result = catch_unwind(AssertUnwindSafe(|| job(&job_token)));
            log::trace!("job '{}' finished", job_name);
            // The handle may have been dropped; the result is then unused.
            let _ = result_tx.send(result);
        });
        sender.send(boxed).map_err(|_| JobError::ShutDown)?;

        Ok(JobHandle {
            name: name.to_string(),
            token,
            result: result_rx,
        })
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("job worker exited with a panic");
            }
        }
    }
}
