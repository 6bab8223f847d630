//! Serial background execution of write tasks.

pub mod executor;

pub use executor::SerialExecutor;

use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// Identifier of a submitted task, time-ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work run by a [`SerialExecutor`].
///
/// Returning [`Error::Interrupted`](crate::Error::Interrupted) reports the
/// task as cancelled; any other error is logged.
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Lifecycle callbacks of submitted tasks, called on the worker thread.
pub trait TaskListener: Send + Sync {
    fn on_start(&self, _id: TaskId) {}

    fn on_cancel(&self, _id: TaskId) {}

    /// Called last for every task that started, whatever its outcome.
    fn on_complete(&self, _id: TaskId) {}
}
