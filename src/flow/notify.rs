//! Notification bus for resource changes.
//!
//! Dispatch is a synchronous fan-out on the committing thread. Observers run
//! outside the registration lock, so an observer may query the service or
//! register and unregister observers from inside its callback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::contract::ResourceId;
use crate::observability::metrics;

/// A resource whose rows changed in a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub resource: ResourceId,
}

/// Receives change events.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

impl<F> ChangeObserver for F
where
    F: Fn(&ChangeEvent) + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) {
        self(event)
    }
}

/// Handle of one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

struct Registration {
    id: ObserverId,
    resource: ResourceId,
    descendants: bool,
    observer: Arc<dyn ChangeObserver>,
}

impl Registration {
    /// An event reaches observers of the same resource, observers of the
    /// resources underneath it, and ancestors registered for descendants.
    fn matches(&self, changed: &ResourceId) -> bool {
        *changed == self.resource
            || self.resource.is_within(changed)
            || (self.descendants && changed.is_within(&self.resource))
    }
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

/// Notification bus delivering [`ChangeEvent`]s to registered observers.
///
/// Cloning is cheap; clones share the same registrations.
#[derive(Clone, Default)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for `resource`.
    ///
    /// With `descendants` set, a collection registration also receives the
    /// events of every item in the collection.
    pub fn register(
        &self,
        resource: ResourceId,
        descendants: bool,
        observer: Arc<dyn ChangeObserver>,
    ) -> ObserverId {
        let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                resource,
                descendants,
                observer,
            });
        tracing::debug!(%id, %resource, descendants, "Registered change observer");
        id
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut registrations = self
            .inner
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        before != registrations.len()
    }

    /// Deliver one event to every matching observer.
    ///
    /// Returns the number of observers that received it.
    pub fn notify(&self, resource: ResourceId) -> usize {
        let targets: Vec<Arc<dyn ChangeObserver>> = self
            .inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.matches(&resource))
            .map(|r| Arc::clone(&r.observer))
            .collect();

        let event = ChangeEvent { resource };
        for observer in &targets {
            observer.on_change(&event);
        }
        metrics::record_notifications(targets.len());
        targets.len()
    }

    /// Deliver one event per resource, in order.
    pub fn notify_all<I>(&self, resources: I) -> usize
    where
        I: IntoIterator<Item = ResourceId>,
    {
        resources.into_iter().map(|r| self.notify(r)).sum()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<ResourceId>>>, Arc<dyn ChangeObserver>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn ChangeObserver> = Arc::new(move |event: &ChangeEvent| {
            sink.lock().unwrap().push(event.resource);
        });
        (seen, observer)
    }

    #[test]
    fn test_collection_observer_with_descendants_sees_items() {
        let bus = NotificationBus::new();
        let (seen, observer) = recorder();
        bus.register(ResourceId::Collection, true, observer);

        assert_eq!(bus.notify(ResourceId::item(4)), 1);
        assert_eq!(bus.notify(ResourceId::Collection), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ResourceId::item(4), ResourceId::Collection]
        );
    }

    #[test]
    fn test_collection_observer_without_descendants_ignores_items() {
        let bus = NotificationBus::new();
        let (seen, observer) = recorder();
        bus.register(ResourceId::Collection, false, observer);

        assert_eq!(bus.notify(ResourceId::item(4)), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_item_observer_sees_own_item_and_collection() {
        let bus = NotificationBus::new();
        let (seen, observer) = recorder();
        bus.register(ResourceId::item(1), false, observer);

        bus.notify_all([ResourceId::item(1), ResourceId::item(2), ResourceId::Collection]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ResourceId::item(1), ResourceId::Collection]
        );
    }

    #[test]
    fn test_unregister() {
        let bus = NotificationBus::new();
        let (seen, observer) = recorder();
        let id = bus.register(ResourceId::Collection, true, observer);
        assert_eq!(bus.observer_count(), 1);

        assert!(bus.unregister(id));
        assert!(!bus.unregister(id));
        assert_eq!(bus.notify(ResourceId::item(1)), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_observer_may_register_during_dispatch() {
        let bus = NotificationBus::new();
        let inner = bus.clone();
        bus.register(
            ResourceId::Collection,
            true,
            Arc::new(move |_: &ChangeEvent| {
                inner.register(ResourceId::Collection, false, Arc::new(|_: &ChangeEvent| {}));
            }),
        );

        bus.notify(ResourceId::item(1));
        assert_eq!(bus.observer_count(), 2);
    }
}
