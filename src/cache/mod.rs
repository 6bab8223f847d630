//! In-process mirror of the settings collection.
//!
//! The cache registers for change events first, then loads the whole
//! collection on a background thread. Accessors block until that load has
//! finished. Change events re-read the affected row and reconcile it.
//!
//! Local writes go through [`PendingWrites`]: each written key gets an
//! overlay entry that wins over the mirrored rows until the commit carrying
//! it settles. Settling drops the entry unless a newer local write replaced
//! it. A commit that did not reach the store also re-reads the rows it
//! touched, restoring what its writes had evicted. Rows evicted by local
//! writes are kept aside until the store confirms their update or removal,
//! so removals can still be reported.
//!
//! One lock guards the load flag, the rows and the overlay; at most one
//! cache method runs at a time. Listeners are called outside the lock.

pub mod loader;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;

use crate::contract::ResourceId;
use crate::error::Result;
use crate::flow::notify::{ChangeEvent, ChangeObserver, ObserverId};
use crate::service::Resolver;
use crate::setting::{Setting, SettingValue};

/// Receives reconciled changes of the cache.
pub trait CacheListener: Send + Sync {
    fn on_inserted_or_updated(&self, setting: &Setting);
    fn on_removed(&self, setting: &Setting);
}

/// Handle of one cache listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheListenerId(u64);

/// An overlay entry and the local write that produced it.
#[derive(Debug)]
struct Pending {
    value: SettingValue,
    generation: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    loaded: bool,
    entries: HashMap<i64, Setting>,
    by_key: HashMap<String, i64>,
    overlay: HashMap<String, Pending>,
    evicted: HashMap<i64, Setting>,
    next_generation: u64,
    detached: bool,
}

impl CacheState {
    fn insert_entry(&mut self, setting: Setting) {
        if let Some(previous) = self.entries.get(&setting.id) {
            if previous.key != setting.key {
                self.by_key.remove(&previous.key);
            }
        }
        if let Some(other) = self.by_key.insert(setting.key.clone(), setting.id) {
            if other != setting.id {
                self.entries.remove(&other);
            }
        }
        self.evicted.remove(&setting.id);
        self.entries.insert(setting.id, setting);
    }

    fn remove_entry(&mut self, id: i64) -> Option<Setting> {
        let removed = self.entries.remove(&id)?;
        if self.by_key.get(&removed.key) == Some(&id) {
            self.by_key.remove(&removed.key);
        }
        Some(removed)
    }

    fn entry_for_key(&self, key: &str) -> Option<&Setting> {
        self.by_key.get(key).and_then(|id| self.entries.get(id))
    }

    /// Move the row holding `key` aside until the store confirms it.
    fn evict_key(&mut self, key: &str) {
        if let Some(id) = self.by_key.remove(key) {
            if let Some(setting) = self.entries.remove(&id) {
                self.evicted.insert(id, setting);
            }
        }
    }

    /// Replace whatever is held for `key` with the stored row, if any.
    fn restore_key(&mut self, key: &str, stored: Option<Setting>) {
        if let Some(id) = self.by_key.remove(key) {
            self.entries.remove(&id);
        }
        self.evicted.retain(|_, s| s.key != key);
        if let Some(setting) = stored {
            self.insert_entry(setting);
        }
    }

    /// Replace every mirrored row with a fresh copy of the collection.
    fn restore_all(&mut self, rows: HashMap<i64, Setting>) {
        self.entries.clear();
        self.by_key.clear();
        self.evicted.clear();
        for (_, setting) in rows {
            self.insert_entry(setting);
        }
    }
}

struct Shared {
    state: Mutex<CacheState>,
    loaded: Condvar,
    resolver: Arc<dyn Resolver>,
    listeners: RwLock<Vec<(CacheListenerId, Arc<dyn CacheListener>)>>,
    next_listener: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state once the initial load has finished.
    fn lock_loaded(&self) -> MutexGuard<'_, CacheState> {
        let guard = self.lock();
        self.await_loading(guard)
    }

    fn await_loading<'a>(&self, guard: MutexGuard<'a, CacheState>) -> MutexGuard<'a, CacheState> {
        self.loaded
            .wait_while(guard, |state| !state.loaded)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) {
        let mut state = self.lock();
        match loader::load_all(self.resolver.as_ref()) {
            Ok(rows) => {
                for (_, setting) in rows {
                    state.insert_entry(setting);
                }
                tracing::info!(rows = state.entries.len(), "Settings cache loaded");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to load settings cache");
            }
        }
        state.loaded = true;
        drop(state);
        self.loaded.notify_all();
    }

    fn listeners(&self) -> Vec<Arc<dyn CacheListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }

    fn put(&self, key: &str, value: SettingValue) -> u64 {
        let mut state = self.lock_loaded();
        let generation = state.next_generation;
        state.next_generation += 1;
        state
            .overlay
            .insert(key.to_string(), Pending { value, generation });
        state.evict_key(key);
        generation
    }

    fn remove(&self, key: &str) {
        let mut state = self.lock_loaded();
        state.overlay.remove(key);
        state.evict_key(key);
    }

    fn clear(&self) {
        let mut state = self.lock_loaded();
        state.overlay.clear();
        state.by_key.clear();
        let entries = std::mem::take(&mut state.entries);
        state.evicted.extend(entries);
    }

    /// Drop the overlay entries of a finished commit. A commit that did not
    /// reach the store also brings the rows it touched back to stored state.
    fn settle(&self, writes: &[(String, u64)], touched: &[String], cleared: bool, stored: bool) {
        let mut state = self.lock_loaded();
        // Nothing confirms stored writes once detached; keep showing them.
        if stored && state.detached {
            return;
        }
        for (key, generation) in writes {
            if state.overlay.get(key).map(|p| p.generation) == Some(*generation) {
                state.overlay.remove(key);
            }
        }
        if stored {
            return;
        }

        let restored = if cleared {
            loader::load_all(self.resolver.as_ref()).map(|rows| state.restore_all(rows))
        } else {
            touched.iter().try_for_each(|key| -> Result<()> {
                let row = loader::load_key(self.resolver.as_ref(), key)?;
                state.restore_key(key, row);
                Ok(())
            })
        };
        match restored {
            Ok(()) => {
                tracing::debug!(keys = touched.len(), cleared, "Cache restored after failed commit")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to restore cache after failed commit"),
        }
    }

    fn confirm_upserted(&self, setting: Setting) {
        self.lock_loaded().insert_entry(setting.clone());
        tracing::trace!(key = %setting.key, id = setting.id, "Cache confirmed row");
        for listener in self.listeners() {
            listener.on_inserted_or_updated(&setting);
        }
    }

    fn confirm_removed(&self, id: i64) {
        let removed = {
            let mut state = self.lock_loaded();
            state.remove_entry(id).or_else(|| state.evicted.remove(&id))
        };
        if let Some(setting) = removed {
            tracing::trace!(key = %setting.key, id, "Cache dropped row");
            for listener in self.listeners() {
                listener.on_removed(&setting);
            }
        }
    }

    fn reconcile(&self, id: i64) {
        drop(self.lock_loaded());
        match loader::load_item(self.resolver.as_ref(), id) {
            Ok(Some(setting)) => self.confirm_upserted(setting),
            Ok(None) => self.confirm_removed(id),
            Err(e) => tracing::warn!(id, error = %e, "Failed to reconcile cached setting"),
        }
    }
}

/// Forwards change events to the cache while it is alive.
struct CacheObserver {
    shared: Weak<Shared>,
}

impl ChangeObserver for CacheObserver {
    fn on_change(&self, event: &ChangeEvent) {
        let Some(id) = event.resource.row_id() else {
            return;
        };
        if let Some(shared) = self.shared.upgrade() {
            shared.reconcile(id);
        }
    }
}

/// Local writes of one commit, shown ahead of the store until settled.
///
/// Dropping it unsettled counts as a commit that never reached the store.
#[must_use = "pending writes are rolled back when dropped unsettled"]
pub struct PendingWrites {
    shared: Arc<Shared>,
    writes: Vec<(String, u64)>,
    touched: Vec<String>,
    cleared: bool,
    settled: bool,
}

impl PendingWrites {
    /// Show `value` for `key` until this commit settles.
    pub fn put(&mut self, key: &str, value: SettingValue) {
        let generation = self.shared.put(key, value);
        self.writes.push((key.to_string(), generation));
        self.touched.push(key.to_string());
    }

    /// Hide `key` until the store confirms its removal.
    pub fn remove(&mut self, key: &str) {
        self.shared.remove(key);
        self.touched.push(key.to_string());
    }

    /// Hide every setting and pending write.
    pub fn clear(&mut self) {
        self.shared.clear();
        self.cleared = true;
    }

    pub fn is_empty(&self) -> bool {
        !self.cleared && self.touched.is_empty()
    }

    /// Finish the commit. `stored` tells whether it reached the store.
    pub fn settle(mut self, stored: bool) {
        self.finish(stored);
    }

    fn finish(&mut self, stored: bool) {
        if std::mem::replace(&mut self.settled, true) || self.is_empty() {
            return;
        }
        self.shared
            .settle(&self.writes, &self.touched, self.cleared, stored);
    }
}

impl Drop for PendingWrites {
    fn drop(&mut self) {
        self.finish(false);
    }
}

impl std::fmt::Debug for PendingWrites {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrites")
            .field("writes", &self.writes.len())
            .field("cleared", &self.cleared)
            .field("settled", &self.settled)
            .finish()
    }
}

/// Local cache of the settings collection.
pub struct SettingsCache {
    shared: Arc<Shared>,
    observer: Mutex<Option<ObserverId>>,
}

impl SettingsCache {
    /// Register for changes and start loading in the background.
    pub fn new(resolver: Arc<dyn Resolver>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::default()),
            loaded: Condvar::new(),
            resolver: Arc::clone(&resolver),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        });

        let observer = resolver.register_observer(
            ResourceId::Collection,
            true,
            Arc::new(CacheObserver {
                shared: Arc::downgrade(&shared),
            }),
        );

        let loading = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("prefbox-cache-loader".into())
            .spawn(move || loading.load());
        if let Err(e) = spawned {
            resolver.unregister_observer(observer);
            return Err(e.into());
        }

        Ok(Self {
            shared,
            observer: Mutex::new(Some(observer)),
        })
    }

    /// Whether the initial load has finished.
    pub fn is_loaded(&self) -> bool {
        self.shared.lock().loaded
    }

    /// Block until the initial load has finished.
    pub fn await_loaded(&self) {
        drop(self.shared.lock_loaded());
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) -> CacheListenerId {
        let id = CacheListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: CacheListenerId) -> bool {
        let mut listeners = self
            .shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        before != listeners.len()
    }

    pub fn contains(&self, key: &str) -> bool {
        let state = self.shared.lock_loaded();
        state.overlay.contains_key(key) || state.by_key.contains_key(key)
    }

    /// The setting for `key`, preferring a pending local write.
    ///
    /// A pending write is returned without a row id.
    pub fn get(&self, key: &str) -> Option<Setting> {
        let state = self.shared.lock_loaded();
        if let Some(pending) = state.overlay.get(key) {
            return Some(Setting::new(key, pending.value.clone()));
        }
        state.entry_for_key(key).cloned()
    }

    /// Every key and value, pending local writes included.
    pub fn get_all(&self) -> HashMap<String, SettingValue> {
        let state = self.shared.lock_loaded();
        let mut all: HashMap<String, SettingValue> = state
            .entries
            .values()
            .map(|s| (s.key.clone(), s.value.clone()))
            .collect();
        for (key, pending) in &state.overlay {
            all.insert(key.clone(), pending.value.clone());
        }
        all
    }

    /// Start recording the local writes of one commit.
    pub fn begin_writes(&self) -> PendingWrites {
        PendingWrites {
            shared: Arc::clone(&self.shared),
            writes: Vec::new(),
            touched: Vec::new(),
            cleared: false,
            settled: false,
        }
    }

    /// Number of local writes still waiting for their commit.
    pub fn pending(&self) -> usize {
        self.shared.lock_loaded().overlay.len()
    }

    /// Number of mirrored rows, pending local writes excluded.
    pub fn len(&self) -> usize {
        self.shared.lock_loaded().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop observing changes and drop every listener.
    ///
    /// Reads keep answering from the last known state.
    pub fn destroy(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.shared.lock().detached = true;
        if let Some(id) = observer {
            self.shared.resolver.unregister_observer(id);
            tracing::debug!(%id, "Settings cache detached");
        }
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Drop for SettingsCache {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SettingsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SettingsCache")
            .field("loaded", &state.loaded)
            .field("entries", &state.entries.len())
            .field("overlay", &state.overlay.len())
            .finish()
    }
}
