//! Single-worker FIFO executor.
//!
//! Tasks run one at a time on a dedicated thread, in submission order.
//! There is no cancellation API; a task counts as cancelled only when it
//! reports its own interruption.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use super::{Task, TaskId, TaskListener};
use crate::error::{Error, Result};

/// Poll interval while waiting for the worker to stop.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

enum Job {
    Run { id: TaskId, task: Task },
    Flush(oneshot::Sender<()>),
}

type Pending = Arc<Mutex<HashSet<TaskId>>>;

/// Runs submitted tasks serially on one named worker thread.
pub struct SerialExecutor {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Pending,
    shutdown_timeout: Duration,
}

impl SerialExecutor {
    pub fn new(name: impl Into<String>, shutdown_timeout: Duration) -> Result<Self> {
        Self::build(name.into(), shutdown_timeout, None)
    }

    pub fn with_listener(
        name: impl Into<String>,
        shutdown_timeout: Duration,
        listener: Arc<dyn TaskListener>,
    ) -> Result<Self> {
        Self::build(name.into(), shutdown_timeout, Some(listener))
    }

    fn build(
        name: String,
        shutdown_timeout: Duration,
        listener: Option<Arc<dyn TaskListener>>,
    ) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending: Pending = Arc::default();

        let worker_pending = Arc::clone(&pending);
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(&worker_name, receiver, worker_pending, listener))?;

        tracing::debug!(executor = %name, "Executor started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            pending,
            shutdown_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, job: Job) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        sender
            .as_ref()
            .ok_or_else(|| Error::Shutdown(self.name.clone()))?
            .send(job)
            .map_err(|_| Error::Shutdown(self.name.clone()))
    }

    /// Queue `task` behind every task submitted before it.
    pub fn execute<F>(&self, task: F) -> Result<TaskId>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = TaskId::generate();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);

        if let Err(e) = self.send(Job::Run {
            id,
            task: Box::new(task),
        }) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }
        tracing::trace!(executor = %self.name, task = %id, "Task queued");
        Ok(id)
    }

    /// Block until every task submitted before this call has finished.
    ///
    /// Must not be called from the worker thread or from async code.
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.send(Job::Flush(done))?;
        wait.blocking_recv()
            .map_err(|_| Error::Shutdown(self.name.clone()))
    }

    /// Number of submitted tasks that have not completed.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop accepting tasks and let the worker drain the queue.
    ///
    /// Waits up to the shutdown timeout. Returns false if the worker was
    /// still busy, in which case it is left to finish on its own.
    pub fn shutdown(&self) -> bool {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return true;
        };

        let deadline = Instant::now() + self.shutdown_timeout;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(SHUTDOWN_POLL);
        }

        if worker.is_finished() {
            if worker.join().is_err() {
                tracing::error!(executor = %self.name, "Executor worker panicked");
            }
            tracing::debug!(executor = %self.name, "Executor stopped");
            true
        } else {
            tracing::warn!(
                executor = %self.name,
                pending = self.pending(),
                "Executor did not stop in time, detaching worker"
            );
            false
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialExecutor")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn run_worker(
    name: &str,
    mut receiver: mpsc::UnboundedReceiver<Job>,
    pending: Pending,
    listener: Option<Arc<dyn TaskListener>>,
) {
    while let Some(job) = receiver.blocking_recv() {
        match job {
            Job::Run { id, task } => {
                run_task(name, id, task, listener.as_deref());
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if let Some(listener) = &listener {
                    listener.on_complete(id);
                }
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::trace!(executor = %name, "Executor queue closed");
}

fn run_task(name: &str, id: TaskId, task: Task, listener: Option<&dyn TaskListener>) {
    if let Some(listener) = listener {
        listener.on_start(id);
    }

    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(())) => {
            tracing::trace!(executor = %name, task = %id, "Task finished");
        }
        Ok(Err(Error::Interrupted(reason))) => {
            tracing::warn!(executor = %name, task = %id, %reason, "Task interrupted");
            if let Some(listener) = listener {
                listener.on_cancel(id);
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(executor = %name, task = %id, error = %e, "Task failed");
        }
        Err(_) => {
            tracing::error!(executor = %name, task = %id, "Task panicked");
        }
    }
}
