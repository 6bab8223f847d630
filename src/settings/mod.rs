//! Typed access to the settings store.
//!
//! [`Settings`] reads through the local cache and writes through editors.
//! An editor's `apply` updates the cache at once and queues the store write
//! on the writer thread; `commit` writes on the calling thread.
//!
//! ```no_run
//! use prefbox::{Config, Settings};
//!
//! let settings = Settings::open(&Config::default())?;
//! settings.edit().put_int("volume", 7).apply();
//! assert_eq!(settings.get_int("volume", 0)?, 7);
//! # Ok::<(), prefbox::Error>(())
//! ```

pub mod editor;
pub mod listeners;

pub use editor::{Commit, Editor, EDITS_PER_YIELD_POINT};
pub use listeners::{ChangeListeners, ListenerId};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::cache::{CacheListener, CacheListenerId, SettingsCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::service::{Resolver, SettingsService};
use crate::setting::{SettingValue, ValueType};
use crate::task::SerialExecutor;

/// Name of the thread applying queued commits.
const WRITER_THREAD: &str = "prefbox-writer";

/// Handle to a settings store.
///
/// Dropping the handle closes it.
pub struct Settings {
    resolver: Arc<dyn Resolver>,
    cache: SettingsCache,
    executor: SerialExecutor,
    listeners: Arc<ChangeListeners>,
    cache_listener: CacheListenerId,
    closed: AtomicBool,
}

impl Settings {
    /// Open the store described by `config` in this process.
    pub fn open(config: &Config) -> Result<Self> {
        let service = SettingsService::open(config)?;
        Self::with_resolver(Arc::new(service), config.shutdown_timeout())
    }

    /// Build the facade over any resolver.
    ///
    /// `shutdown_timeout` bounds how long [`Settings::close`] waits for
    /// queued commits.
    pub fn with_resolver(resolver: Arc<dyn Resolver>, shutdown_timeout: Duration) -> Result<Self> {
        let cache = SettingsCache::new(Arc::clone(&resolver))?;
        let executor = SerialExecutor::new(WRITER_THREAD, shutdown_timeout)?;
        let listeners = Arc::new(ChangeListeners::new(shutdown_timeout)?);
        let listener: Arc<dyn CacheListener> = Arc::clone(&listeners) as Arc<dyn CacheListener>;
        let cache_listener = cache.add_listener(listener);

        Ok(Self {
            resolver,
            cache,
            executor,
            listeners,
            cache_listener,
            closed: AtomicBool::new(false),
        })
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &SettingsCache {
        &self.cache
    }

    pub(crate) fn executor(&self) -> &SerialExecutor {
        &self.executor
    }

    pub fn contains(&self, key: &str) -> bool {
        self.cache.contains(key)
    }

    pub fn get_all(&self) -> HashMap<String, SettingValue> {
        self.cache.get_all()
    }

    /// The raw value of `key`, if set.
    pub fn get(&self, key: &str) -> Option<SettingValue> {
        self.cache.get(key).map(|s| s.value)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(SettingValue::Bool(b)) => Ok(b),
            Some(other) => Err(mismatch(key, ValueType::Bool, &other)),
        }
    }

    pub fn get_float(&self, key: &str, default: f32) -> Result<f32> {
        match self.get(key) {
            None => Ok(default),
            Some(SettingValue::Float(f)) => Ok(f),
            Some(other) => Err(mismatch(key, ValueType::Float, &other)),
        }
    }

    pub fn get_int(&self, key: &str, default: i32) -> Result<i32> {
        match self.get(key) {
            None => Ok(default),
            Some(SettingValue::Int(i)) => Ok(i),
            Some(other) => Err(mismatch(key, ValueType::Int, &other)),
        }
    }

    pub fn get_long(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(SettingValue::Long(l)) => Ok(l),
            Some(other) => Err(mismatch(key, ValueType::Long, &other)),
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> Result<String> {
        match self.get(key) {
            None => Ok(default.to_string()),
            Some(SettingValue::String(s)) => Ok(s),
            Some(other) => Err(mismatch(key, ValueType::String, &other)),
        }
    }

    pub fn get_string_set(&self, key: &str, default: BTreeSet<String>) -> Result<BTreeSet<String>> {
        match self.get(key) {
            None => Ok(default),
            Some(SettingValue::StringSet(set)) => Ok(set),
            Some(other) => Err(mismatch(key, ValueType::StringSet, &other)),
        }
    }

    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(key) {
            None => Ok(None),
            Some(SettingValue::Opaque(bytes)) => Ok(Some(bytes)),
            Some(other) => Err(mismatch(key, ValueType::Opaque, &other)),
        }
    }

    /// Decode an object stored with [`Editor::put_object`].
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get_bytes(key)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .transpose()
    }

    pub fn edit(&self) -> Editor<'_> {
        Editor::new(self)
    }

    /// Call `callback` with the key of every changed setting.
    ///
    /// Callbacks run on a dedicated callback thread.
    pub fn register_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.register(callback)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.listeners.unregister(id)
    }

    /// Block until every applied commit has reached the store and every
    /// resulting callback has run.
    pub fn flush(&self) -> Result<()> {
        self.executor.flush()?;
        self.listeners.flush()
    }

    /// Finish queued commits, detach the cache and stop the callback thread.
    ///
    /// Reads keep answering from the last cached state plus later commits.
    /// Later `apply` calls are rejected and leave the cache as it was.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.executor.shutdown() {
            tracing::warn!("Queued commits did not finish before shutdown timeout");
        }
        self.cache.remove_listener(self.cache_listener);
        self.cache.destroy();
        self.listeners.destroy();
        tracing::info!("Settings closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Settings {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("executor", &self.executor.name())
            .field("listeners", &self.listeners.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn mismatch(key: &str, expected: ValueType, actual: &SettingValue) -> Error {
    Error::State {
        key: key.to_string(),
        expected: expected.tag(),
        actual: actual.value_type().tag(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    fn settings() -> (TempDir, Settings) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::open(&Config::with_data_dir(dir.path())).unwrap();
        (dir, settings)
    }

    #[test]
    fn test_defaults_for_missing_keys() {
        let (_dir, settings) = settings();
        assert!(!settings.contains("missing"));
        assert!(settings.get_bool("missing", true).unwrap());
        assert_eq!(settings.get_string("missing", "dflt").unwrap(), "dflt");
        assert_eq!(settings.get_bytes("missing").unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_fails_fast() {
        let (_dir, settings) = settings();
        assert!(settings.edit().put_string("volume", "loud").commit());

        let err = settings.get_int("volume", 0).unwrap_err();
        assert!(matches!(
            err,
            Error::State {
                expected: "int32",
                actual: "string",
                ..
            }
        ));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Window {
        width: u32,
        height: u32,
    }

    #[test]
    fn test_object_round_trip() {
        let (_dir, settings) = settings();
        let window = Window {
            width: 800,
            height: 600,
        };
        assert!(settings.edit().put_object("window", &window).unwrap().commit());
        assert_eq!(settings.get_object::<Window>("window").unwrap(), Some(window));
    }

    #[test]
    fn test_undecodable_object_is_an_error() {
        let (_dir, settings) = settings();
        assert!(settings.edit().put_bytes("window", vec![0xff, 0x00]).commit());
        let err = settings.get_object::<Window>("window").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, settings) = settings();
        settings.edit().put_int("a", 1).apply();
        settings.close();
        settings.close();
        assert!(settings.is_closed());
        assert_eq!(settings.get_int("a", 0).unwrap(), 1);
    }
}
