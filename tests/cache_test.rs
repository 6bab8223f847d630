//! Integration tests for the local cache.
//!
//! Tests:
//! - First access waits for the initial load
//! - Pending writes win until their commit finishes
//! - Failed commits leave no pending writes behind
//! - Changes made through another handle are mirrored

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{wait_for, TestFixture};
use prefbox::{
    ChangeObserver, Error, Filter, ObserverId, Operation, OperationResult, Query, Resolver,
    ResourceId, Result, Setting, SettingValue, Settings, SettingsCache, SettingsService,
};

/// Resolver over a real service whose batches can be held back or failed.
struct FlakyResolver {
    inner: Arc<SettingsService>,
    failures: AtomicUsize,
    gate: Mutex<Option<Receiver<()>>>,
}

impl FlakyResolver {
    fn new(inner: Arc<SettingsService>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// Fail the next `count` batches.
    fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Hold the next batch until the returned sender fires.
    fn hold_next(&self) -> Sender<()> {
        let (release, wait) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(wait);
        release
    }
}

impl Resolver for FlakyResolver {
    fn query(&self, resource: ResourceId, query: &Query) -> Result<Vec<Setting>> {
        self.inner.query(resource, query)
    }

    fn insert(&self, resource: ResourceId, setting: &Setting) -> Result<ResourceId> {
        self.inner.insert(resource, setting)
    }

    fn update(&self, resource: ResourceId, values: &Setting, filter: Option<&Filter>) -> Result<usize> {
        self.inner.update(resource, values, filter)
    }

    fn delete(&self, resource: ResourceId, filter: Option<&Filter>) -> Result<usize> {
        self.inner.delete(resource, filter)
    }

    fn bulk_insert(&self, resource: ResourceId, settings: &[Setting]) -> Result<usize> {
        self.inner.bulk_insert(resource, settings)
    }

    fn apply_batch(&self, operations: Vec<Operation>) -> Result<Vec<OperationResult>> {
        let gate = self.gate.lock().unwrap().take();
        if let Some(wait) = gate {
            let _ = wait.recv();
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Contention { yield_points: 0 });
        }
        self.inner.apply_batch(operations)
    }

    fn upsert(&self, setting: &Setting) -> Result<ResourceId> {
        self.inner.upsert(setting)
    }

    fn register_observer(
        &self,
        resource: ResourceId,
        descendants: bool,
        observer: Arc<dyn ChangeObserver>,
    ) -> ObserverId {
        self.inner.register_observer(resource, descendants, observer)
    }

    fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.unregister_observer(id)
    }
}

/// A facade over a flaky resolver, plus a second handle on the same store.
fn flaky_settings(fixture: &TestFixture) -> (Arc<SettingsService>, Arc<FlakyResolver>, Settings) {
    let service = Arc::new(fixture.service());
    let resolver = Arc::new(FlakyResolver::new(Arc::clone(&service)));
    let settings = Settings::with_resolver(
        Arc::clone(&resolver) as Arc<dyn Resolver>,
        Duration::from_secs(5),
    )
    .unwrap();
    (service, resolver, settings)
}

#[test]
fn test_first_access_reflects_every_preloaded_row() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    let settings: Vec<Setting> = (0..2_000)
        .map(|i| Setting::new(format!("pre-{i}"), i as i64))
        .collect();
    service.bulk_insert(ResourceId::Collection, &settings).unwrap();

    // Race several readers against the background load.
    for _ in 0..5 {
        let cache = SettingsCache::new(Arc::new(fixture.service())).unwrap();
        assert!(cache.contains("pre-1999"));
        assert_eq!(cache.len(), 2_000);
        assert_eq!(cache.get("pre-0").unwrap().value, SettingValue::Long(0));
    }
}

#[test]
fn test_concurrent_first_reads_all_wait_for_load() {
    let fixture = TestFixture::new();
    let service = fixture.service();
    for i in 0..300i32 {
        service.upsert(&Setting::new(format!("k{i}"), i)).unwrap();
    }

    let cache = SettingsCache::new(Arc::new(fixture.service())).unwrap();
    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                assert_eq!(cache.get_all().len(), 300);
            });
        }
    });
    assert!(cache.is_loaded());
}

#[test]
fn test_pending_write_wins_until_its_commit_finishes() {
    let fixture = TestFixture::new();
    let (service, resolver, settings) = flaky_settings(&fixture);
    assert!(settings.edit().put_string("theme", "light").commit());

    let release = resolver.hold_next();
    settings.edit().put_string("theme", "dark").apply();
    // Another handle changes the store while the commit is held back.
    service.upsert(&Setting::new("theme", "stale")).unwrap();
    assert_eq!(settings.get_string("theme", "").unwrap(), "dark");

    release.send(()).unwrap();
    settings.flush().unwrap();
    assert_eq!(settings.get_string("theme", "").unwrap(), "dark");
    let cached = settings.cache().get("theme").unwrap();
    assert!(cached.is_persisted());
    assert_eq!(settings.cache().pending(), 0);
}

#[test]
fn test_failed_commit_leaves_later_writes_visible() {
    let fixture = TestFixture::new();
    let (service, resolver, settings) = flaky_settings(&fixture);

    resolver.fail_next(1);
    assert!(!settings.edit().put_string("k", "never-stored").commit());
    assert!(!settings.contains("k"));

    service.upsert(&Setting::new("k", "theirs")).unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "theirs");
    service.upsert(&Setting::new("k", "theirs-again")).unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "theirs-again");
}

#[test]
fn test_failed_apply_restores_stored_rows() {
    let fixture = TestFixture::new();
    let (service, resolver, settings) = flaky_settings(&fixture);
    assert!(settings
        .edit()
        .put_string("a", "kept")
        .put_string("b", "kept")
        .commit());

    resolver.fail_next(1);
    settings
        .edit()
        .put_string("a", "lost")
        .remove("b")
        .put_string("c", "lost")
        .apply();
    settings.flush().unwrap();

    assert_eq!(settings.get_string("a", "").unwrap(), "kept");
    assert_eq!(settings.get_string("b", "").unwrap(), "kept");
    assert!(!settings.contains("c"));
    assert_eq!(settings.cache().pending(), 0);

    service.upsert(&Setting::new("a", "theirs")).unwrap();
    assert_eq!(settings.get_string("a", "").unwrap(), "theirs");
}

#[test]
fn test_failed_clear_restores_every_row() {
    let fixture = TestFixture::new();
    let (_service, resolver, settings) = flaky_settings(&fixture);
    assert!(settings.edit().put_int("a", 1).put_int("b", 2).commit());

    resolver.fail_next(1);
    assert!(!settings.edit().clear().put_int("a", 10).commit());

    let all = settings.get_all();
    assert_eq!(all.len(), 2);
    assert_eq!(all["a"], SettingValue::Int(1));
    assert_eq!(all["b"], SettingValue::Int(2));
}

#[test]
fn test_external_delete_during_pending_write() {
    let fixture = TestFixture::new();
    let (service, resolver, settings) = flaky_settings(&fixture);
    assert!(settings.edit().put_string("k", "old").commit());

    let release = resolver.hold_next();
    settings.edit().put_string("k", "mine").apply();
    service
        .delete(ResourceId::Collection, Some(&Filter::Key("k".into())))
        .unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "mine");

    release.send(()).unwrap();
    settings.flush().unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "mine");
    assert!(settings.cache().get("k").unwrap().is_persisted());

    // Once settled, a delete elsewhere is mirrored.
    service
        .delete(ResourceId::Collection, Some(&Filter::Key("k".into())))
        .unwrap();
    assert!(!settings.contains("k"));
}

#[test]
fn test_foreign_write_after_commit_is_mirrored() {
    let fixture = TestFixture::new();
    let (service, _resolver, settings) = flaky_settings(&fixture);

    assert!(settings.edit().put_string("k", "mine").commit());
    service.upsert(&Setting::new("k", "theirs")).unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "theirs");

    settings.edit().put_string("k", "mine-again").apply();
    settings.flush().unwrap();
    service.upsert(&Setting::new("k", "theirs-again")).unwrap();
    assert_eq!(settings.get_string("k", "").unwrap(), "theirs-again");
}

#[test]
fn test_nan_write_does_not_pin_the_key() {
    let fixture = TestFixture::new();
    let (service, _resolver, settings) = flaky_settings(&fixture);

    assert!(settings.edit().put_float("f", f32::NAN).commit());
    assert!(settings.get_float("f", 0.0).unwrap().is_nan());

    service.upsert(&Setting::new("f", 2.5f32)).unwrap();
    assert_eq!(settings.get_float("f", 0.0).unwrap(), 2.5);
}

#[test]
fn test_changes_through_the_service_are_mirrored() {
    let fixture = TestFixture::new();
    let settings = fixture.settings();
    let resolver = Arc::clone(settings.resolver());

    let id = resolver.upsert(&Setting::new("volume", 3i32)).unwrap();
    assert_eq!(settings.get_int("volume", 0).unwrap(), 3);

    resolver
        .update(id, &Setting::new("loudness", 5i32), None)
        .unwrap();
    assert!(!settings.contains("volume"));
    assert_eq!(settings.get_int("loudness", 0).unwrap(), 5);

    resolver.delete(id, None).unwrap();
    assert!(wait_for(Duration::from_secs(5), || !settings.contains("loudness")));
    assert!(settings.get_all().is_empty());
}
