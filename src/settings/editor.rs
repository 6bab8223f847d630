//! Editors and the commits they build.
//!
//! An editor collects puts, removals and at most one clear into a
//! [`Commit`]. The clear always runs first, whatever the call order, and
//! the remaining edits follow in call order.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use super::Settings;
use crate::cache::{PendingWrites, SettingsCache};
use crate::contract::ResourceId;
use crate::error::Result;
use crate::observability::metrics;
use crate::service::{Operation, Resolver};
use crate::setting::{Setting, SettingValue};

/// Edits a commit may carry between declared yield points.
pub const EDITS_PER_YIELD_POINT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
enum Edit {
    Put { key: String, value: SettingValue },
    Remove { key: String },
}

/// A batch of edits applied to the cache and then to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    clear: bool,
    edits: Vec<Edit>,
}

impl Commit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<SettingValue>) {
        self.edits.push(Edit::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn remove(&mut self, key: impl Into<String>) {
        self.edits.push(Edit::Remove { key: key.into() });
    }

    pub fn clear(&mut self) {
        self.clear = true;
    }

    pub fn is_empty(&self) -> bool {
        !self.clear && self.edits.is_empty()
    }

    /// Reflect the edits in the cache so readers see them immediately.
    ///
    /// The returned writes must be settled once the commit has finished.
    pub fn cache(&self, cache: &SettingsCache) -> PendingWrites {
        let mut pending = cache.begin_writes();
        if self.clear {
            pending.clear();
        }
        for edit in &self.edits {
            match edit {
                Edit::Put { key, value } if !key.is_empty() => pending.put(key, value.clone()),
                Edit::Remove { key } if !key.is_empty() => pending.remove(key),
                _ => {}
            }
        }
        pending
    }

    /// The store operations of this commit, clear first.
    pub fn operations(&self) -> Vec<Operation> {
        let clear = self
            .clear
            .then(|| Operation::delete(ResourceId::Collection));
        let edits = self.edits.iter().map(|edit| match edit {
            Edit::Put { key, value } => Operation::upsert(Setting::new(key.clone(), value.clone())),
            Edit::Remove { key } => Operation::delete_key(key.clone()),
        });

        clear
            .into_iter()
            .chain(edits)
            .enumerate()
            .map(|(i, op)| {
                if i > 0 && i % EDITS_PER_YIELD_POINT == 0 {
                    op.with_yield_allowed()
                } else {
                    op
                }
            })
            .collect()
    }

    /// Apply the commit to the store as one batch.
    pub fn execute(&self, resolver: &dyn Resolver) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let operations = self.operations();
        let count = operations.len();
        resolver.apply_batch(operations)?;
        tracing::debug!(operations = count, clear = self.clear, "Commit applied");
        Ok(())
    }
}

/// Collects edits for one commit.
///
/// Nothing reaches the cache or the store until [`Editor::apply`] or
/// [`Editor::commit`].
#[must_use = "edits are discarded unless applied or committed"]
pub struct Editor<'a> {
    settings: &'a Settings,
    commit: Commit,
}

impl<'a> Editor<'a> {
    pub(super) fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            commit: Commit::new(),
        }
    }

    pub fn put(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.commit.put(key, value);
        self
    }

    pub fn put_bool(self, key: impl Into<String>, value: bool) -> Self {
        self.put(key, value)
    }

    pub fn put_float(self, key: impl Into<String>, value: f32) -> Self {
        self.put(key, value)
    }

    pub fn put_int(self, key: impl Into<String>, value: i32) -> Self {
        self.put(key, value)
    }

    pub fn put_long(self, key: impl Into<String>, value: i64) -> Self {
        self.put(key, value)
    }

    pub fn put_string(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.put(key, SettingValue::String(value.into()))
    }

    pub fn put_string_set<I, S>(self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        self.put(key, set)
    }

    pub fn put_bytes(self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.put(key, SettingValue::Opaque(value.into()))
    }

    /// Store any serializable value as a JSON-encoded opaque blob.
    pub fn put_object<T: Serialize + ?Sized>(self, key: impl Into<String>, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.put_bytes(key, bytes))
    }

    pub fn remove(mut self, key: impl Into<String>) -> Self {
        self.commit.remove(key);
        self
    }

    /// Remove every setting before the other edits of this editor.
    pub fn clear(mut self) -> Self {
        self.commit.clear();
        self
    }

    /// Update the cache now and write to the store in the background.
    ///
    /// Store failures are logged, never reported to the caller.
    pub fn apply(self) {
        let commit = self.commit;
        let pending = commit.cache(self.settings.cache());

        let resolver = Arc::clone(self.settings.resolver());
        let queued = self.settings.executor().execute(move || {
            let result = commit.execute(resolver.as_ref());
            pending.settle(result.is_ok());
            metrics::record_commit("apply", result.is_ok());
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Background commit failed");
            }
            result
        });
        if let Err(e) = queued {
            metrics::record_commit("apply", false);
            tracing::warn!(error = %e, "Background commit rejected");
        }
    }

    /// Update the cache and write to the store on this thread.
    ///
    /// Returns whether the store accepted every edit.
    pub fn commit(self) -> bool {
        let pending = self.commit.cache(self.settings.cache());
        let result = self.commit.execute(self.settings.resolver().as_ref());
        pending.settle(result.is_ok());
        metrics::record_commit("commit", result.is_ok());
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Commit failed");
                false
            }
        }
    }
}
