//! Change listeners of the facade.
//!
//! Listeners receive the key of every setting the cache reconciles. They
//! are called on a dedicated callback thread, never on the thread that
//! committed the change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::cache::CacheListener;
use crate::error::Result;
use crate::setting::Setting;
use crate::task::SerialExecutor;

/// Name of the callback thread.
const CALLBACK_THREAD: &str = "prefbox-callbacks";

/// Handle of one change listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    callbacks: RwLock<Vec<(ListenerId, Callback)>>,
}

impl Registry {
    fn snapshot(&self) -> Vec<Callback> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, c)| Arc::clone(c))
            .collect()
    }
}

/// Dispatches cache changes to registered callbacks.
pub struct ChangeListeners {
    registry: Arc<Registry>,
    callbacks: SerialExecutor,
}

impl ChangeListeners {
    pub fn new(shutdown_timeout: Duration) -> Result<Self> {
        Ok(Self {
            registry: Arc::default(),
            callbacks: SerialExecutor::new(CALLBACK_THREAD, shutdown_timeout)?,
        })
    }

    pub fn register<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = ListenerId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut callbacks = self
            .registry
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(l, _)| *l != id);
        before != callbacks.len()
    }

    pub fn len(&self) -> usize {
        self.registry
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until every queued callback has run.
    pub fn flush(&self) -> Result<()> {
        self.callbacks.flush()
    }

    /// Drop every callback and stop the callback thread.
    pub fn destroy(&self) {
        self.callbacks.shutdown();
        self.registry
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn dispatch(&self, key: &str) {
        if self.is_empty() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let key = key.to_string();
        let queued = self.callbacks.execute(move || {
            for callback in registry.snapshot() {
                callback(&key);
            }
            Ok(())
        });
        if let Err(e) = queued {
            tracing::debug!(error = %e, "Dropped change callback");
        }
    }
}

impl CacheListener for ChangeListeners {
    fn on_inserted_or_updated(&self, setting: &Setting) {
        self.dispatch(&setting.key);
    }

    fn on_removed(&self, setting: &Setting) {
        self.dispatch(&setting.key);
    }
}
