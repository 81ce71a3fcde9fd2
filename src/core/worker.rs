//! Cancellable background workers with bounded joins.
//!
//! Every long-running computation outside the tick loop (state-model fitting,
//! point estimation, posterior sampling, relabeling, the engine loop itself)
//! runs in a [`BackgroundJob`]. The job body receives a [`CancelToken`] and is
//! expected to check it once per iteration. [`BackgroundJob::stop`] raises the
//! token and waits for the thread to finish, giving up with
//! [`WorkerError::JoinTimeout`] instead of detaching silently.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::error::WorkerError;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lock-free progress counters a worker publishes while running.
#[derive(Debug, Default)]
pub struct Progress {
    iterations: AtomicUsize,
    metric_bits: AtomicU32,
}

impl Progress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, iterations: usize, metric: f32) {
        self.iterations.store(iterations, Ordering::Relaxed);
        self.metric_bits.store(metric.to_bits(), Ordering::Relaxed);
    }

    pub fn bump(&self) -> usize {
        self.iterations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn metric(&self) -> f32 {
        f32::from_bits(self.metric_bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub enum JobPoll<T> {
    Running,
    Finished(T),
    /// The body observed the cancel token and returned nothing.
    Cancelled,
    /// The body panicked.
    Failed,
}

pub struct BackgroundJob<T> {
    name: String,
    cancel: CancelToken,
    done: Receiver<Option<T>>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl<T: Send + 'static> BackgroundJob<T> {
    pub fn spawn<F>(name: &str, body: F) -> Result<Self, WorkerError>
    where
        F: FnOnce(&CancelToken) -> Option<T> + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (tx, rx) = mpsc::sync_channel(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let out = body(&token);
                // The receiver may already be gone if the owner was dropped.
                let _ = tx.send(out);
            })
            .map_err(|source| WorkerError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            name: name.to_string(),
            cancel,
            done: rx,
            handle: Some(handle),
            finished: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Non-blocking check for completion. Yields the result at most once.
    pub fn poll(&mut self) -> JobPoll<T> {
        if self.finished {
            return JobPoll::Cancelled;
        }
        let outcome = match self.done.try_recv() {
            Ok(Some(v)) => JobPoll::Finished(v),
            Ok(None) => JobPoll::Cancelled,
            Err(TryRecvError::Empty) => return JobPoll::Running,
            Err(TryRecvError::Disconnected) => JobPoll::Failed,
        };
        self.finished = true;
        // The body has returned; the thread is exiting.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        outcome
    }

    /// Raise the cancel token and wait up to `timeout` for the thread to exit.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if !self.finished {
            match self.done.recv_timeout(timeout) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => self.finished = true,
                Err(RecvTimeoutError::Timeout) => {
                    self.handle = Some(handle);
                    return Err(WorkerError::JoinTimeout {
                        name: self.name.clone(),
                        timeout,
                    });
                }
            }
        }
        handle
            .join()
            .map_err(|_| WorkerError::Panicked(self.name.clone()))
    }
}

impl<T> Drop for BackgroundJob<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.finished {
            if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(DEFAULT_JOIN_TIMEOUT) {
                warn!(worker = %self.name, "worker still running after drop timeout; detaching");
                return;
            }
        }
        let _ = handle.join();
    }
}
