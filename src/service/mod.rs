//! The settings service.
//!
//! Every mutating call runs in a write transaction: it joins the one open on
//! the caller's [`TxContext`] or starts its own. Resources are marked dirty
//! only for rows that actually changed, and are published once, when the
//! owning transaction commits.

pub mod batch;
pub mod operation;

pub use batch::{BULK_INSERTS_PER_YIELD_POINT, MAX_OPERATIONS_PER_YIELD_POINT};
pub use operation::{Operation, OperationKind, OperationResult};

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::contract::{Contract, ResourceId};
use crate::error::{Error, Result};
use crate::flow::notify::{ChangeObserver, NotificationBus, ObserverId};
use crate::setting::Setting;
use crate::storage::reader::ReaderPool;
use crate::storage::store::{self, Filter, Query};
use crate::storage::transaction::{Transaction, TransactionManager, TxContext, YieldHook};
use crate::storage::Storage;

/// Resolver-style access to the settings collection.
///
/// This is the seam between the cache and facade and whatever transport
/// reaches the service; [`SettingsService`] is the in-process implementation.
pub trait Resolver: Send + Sync {
    /// Rows of the collection, or of one item, matching `query`.
    fn query(&self, resource: ResourceId, query: &Query) -> Result<Vec<Setting>>;

    /// Insert a row into the collection, returning the new item.
    fn insert(&self, resource: ResourceId, setting: &Setting) -> Result<ResourceId>;

    /// Overwrite every matching row, returning how many changed.
    fn update(&self, resource: ResourceId, values: &Setting, filter: Option<&Filter>)
        -> Result<usize>;

    /// Delete every matching row, returning how many were removed.
    fn delete(&self, resource: ResourceId, filter: Option<&Filter>) -> Result<usize>;

    /// Insert many rows in one transaction with periodic yield points.
    fn bulk_insert(&self, resource: ResourceId, settings: &[Setting]) -> Result<usize>;

    /// Apply operations atomically with one change publication.
    fn apply_batch(&self, operations: Vec<Operation>) -> Result<Vec<OperationResult>>;

    /// Update the row holding the setting's key, or insert one.
    fn upsert(&self, setting: &Setting) -> Result<ResourceId>;

    fn register_observer(
        &self,
        resource: ResourceId,
        descendants: bool,
        observer: Arc<dyn ChangeObserver>,
    ) -> ObserverId;

    fn unregister_observer(&self, id: ObserverId) -> bool;
}

/// Transactional settings service over SQLite.
pub struct SettingsService {
    storage: Storage,
    contract: Contract,
    transactions: TransactionManager,
}

impl SettingsService {
    /// Open the database described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Storage::open(config)?;
        Ok(Self::new(storage, config.contract(), config.yield_sleep()))
    }

    pub fn new(storage: Storage, contract: Contract, yield_sleep: Duration) -> Self {
        let transactions =
            TransactionManager::new(storage.writer().clone(), NotificationBus::new(), yield_sleep);
        Self {
            storage,
            contract,
            transactions,
        }
    }

    /// Observe every yield point of bulk inserts and batches.
    pub fn with_yield_hook(mut self, hook: YieldHook) -> Self {
        self.transactions.set_yield_hook(hook);
        self
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn bus(&self) -> &NotificationBus {
        self.transactions.bus()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    fn reader(&self) -> &ReaderPool {
        self.storage.reader()
    }

    /// Run `f` as one batch: every call it makes with the given context
    /// commits together, and changes are published once at the end.
    pub fn batch<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Self, &mut TxContext) -> Result<T>,
    {
        let mut ctx = TxContext::new();
        self.in_batch(&mut ctx, |ctx| f(self, ctx))
    }

    /// Start or join a batch on `ctx`, run `f`, and end the batch if this
    /// call started it.
    fn in_batch<T, F>(&self, ctx: &mut TxContext, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        self.transactions.start_transaction(ctx, true)?;
        let result = f(ctx);
        if result.is_ok() {
            if let Some(tx) = ctx.transaction_mut() {
                tx.mark_successful(true);
            }
        }
        let ended = self.transactions.end_transaction(ctx, true);
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Start or join a transaction on `ctx` for a single operation.
    fn in_transaction<T, F>(&self, ctx: &mut TxContext, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let tx = self.transactions.start_transaction(ctx, false)?;
        let result = op(tx);
        if result.is_ok() {
            tx.mark_successful(false);
        }
        let ended = self.transactions.end_transaction(ctx, false);
        let value = result?;
        ended?;
        Ok(value)
    }

    fn invalid(&self, resource: ResourceId) -> Error {
        Error::InvalidResource(self.contract.uri(&resource))
    }

    /// Query through the open transaction, if any, so uncommitted rows of the
    /// caller's own batch are visible.
    pub fn query_in(
        &self,
        ctx: &TxContext,
        resource: ResourceId,
        query: &Query,
    ) -> Result<Vec<Setting>> {
        match ctx.transaction() {
            Some(tx) => store::select(tx.connection(), resource.row_id(), query),
            None => self.reader().select(resource.row_id(), query),
        }
    }

    pub fn insert_in(
        &self,
        ctx: &mut TxContext,
        resource: ResourceId,
        setting: &Setting,
    ) -> Result<ResourceId> {
        if !resource.is_collection() {
            return Err(self.invalid(resource));
        }
        self.in_transaction(ctx, |tx| {
            let id = store::insert(tx.connection(), setting)?;
            let inserted = ResourceId::item(id);
            tx.mark_dirty(inserted);
            tracing::debug!(key = %setting.key, id, "Inserted setting");
            Ok(inserted)
        })
    }

    pub fn update_in(
        &self,
        ctx: &mut TxContext,
        resource: ResourceId,
        values: &Setting,
        filter: Option<&Filter>,
    ) -> Result<usize> {
        self.in_transaction(ctx, |tx| {
            let ids = store::select_ids(tx.connection(), resource.row_id(), filter)?;
            let mut count = 0;
            for id in ids {
                if store::update_by_id(tx.connection(), id, values)? > 0 {
                    tx.mark_dirty(ResourceId::item(id));
                    count += 1;
                }
            }
            tracing::debug!(%resource, count, "Updated settings");
            Ok(count)
        })
    }

    pub fn delete_in(
        &self,
        ctx: &mut TxContext,
        resource: ResourceId,
        filter: Option<&Filter>,
    ) -> Result<usize> {
        self.in_transaction(ctx, |tx| {
            let deleted = if resource.is_collection() && filter.is_none() {
                store::delete_all(tx.connection())?
            } else {
                let mut deleted = Vec::new();
                for id in store::select_ids(tx.connection(), resource.row_id(), filter)? {
                    if store::delete_by_id(tx.connection(), id)? > 0 {
                        deleted.push(id);
                    }
                }
                deleted
            };
            for id in &deleted {
                tx.mark_dirty(ResourceId::item(*id));
            }
            tracing::debug!(%resource, count = deleted.len(), "Deleted settings");
            Ok(deleted.len())
        })
    }

    /// Update the row holding the setting's key, leaving its id untouched,
    /// or insert a new row.
    pub fn upsert_in(&self, ctx: &mut TxContext, setting: &Setting) -> Result<ResourceId> {
        if setting.key.is_empty() {
            return Err(Error::InvalidArgument("setting key must not be empty".into()));
        }
        self.in_transaction(ctx, |tx| {
            let existing = store::find_id_by_key(tx.connection(), &setting.key)?;

            let id = match existing {
                Some(id) => {
                    store::update_by_id(tx.connection(), id, setting)?;
                    id
                }
                None => store::insert(tx.connection(), setting)?,
            };
            let resource = ResourceId::item(id);
            tx.mark_dirty(resource);
            tracing::debug!(key = %setting.key, id, updated = existing.is_some(), "Upserted setting");
            Ok(resource)
        })
    }
}

impl Resolver for SettingsService {
    fn query(&self, resource: ResourceId, query: &Query) -> Result<Vec<Setting>> {
        self.reader().select(resource.row_id(), query)
    }

    fn insert(&self, resource: ResourceId, setting: &Setting) -> Result<ResourceId> {
        self.insert_in(&mut TxContext::new(), resource, setting)
    }

    fn update(
        &self,
        resource: ResourceId,
        values: &Setting,
        filter: Option<&Filter>,
    ) -> Result<usize> {
        self.update_in(&mut TxContext::new(), resource, values, filter)
    }

    fn delete(&self, resource: ResourceId, filter: Option<&Filter>) -> Result<usize> {
        self.delete_in(&mut TxContext::new(), resource, filter)
    }

    fn bulk_insert(&self, resource: ResourceId, settings: &[Setting]) -> Result<usize> {
        self.bulk_insert_in(&mut TxContext::new(), resource, settings)
    }

    fn apply_batch(&self, operations: Vec<Operation>) -> Result<Vec<OperationResult>> {
        self.apply_batch_in(&mut TxContext::new(), &operations)
    }

    fn upsert(&self, setting: &Setting) -> Result<ResourceId> {
        self.upsert_in(&mut TxContext::new(), setting)
    }

    fn register_observer(
        &self,
        resource: ResourceId,
        descendants: bool,
        observer: Arc<dyn ChangeObserver>,
    ) -> ObserverId {
        self.bus().register(resource, descendants, observer)
    }

    fn unregister_observer(&self, id: ObserverId) -> bool {
        self.bus().unregister(id)
    }
}

impl std::fmt::Debug for SettingsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsService")
            .field("storage", &self.storage)
            .field("contract", &self.contract)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::notify::ChangeEvent;
    use crate::setting::SettingValue;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn service() -> (TempDir, SettingsService) {
        let dir = TempDir::new().unwrap();
        let service = SettingsService::open(&Config::with_data_dir(dir.path())).unwrap();
        (dir, service)
    }

    fn record(service: &SettingsService) -> Arc<Mutex<Vec<ResourceId>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        service.register_observer(
            ResourceId::Collection,
            true,
            Arc::new(move |e: &ChangeEvent| sink.lock().unwrap().push(e.resource)),
        );
        events
    }

    #[test]
    fn test_insert_then_query_by_item() {
        let (_dir, service) = service();
        let item = service
            .insert(ResourceId::Collection, &Setting::new("a", 5i64))
            .unwrap();

        let rows = service.query(item, &Query::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, SettingValue::Long(5));
        assert_eq!(Some(rows[0].id), item.row_id());
    }

    #[test]
    fn test_insert_into_item_is_invalid() {
        let (_dir, service) = service();
        let err = service
            .insert(ResourceId::item(1), &Setting::new("a", 1i32))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResource(uri) if uri == "prefbox/settings/1"));
    }

    #[test]
    fn test_upsert_keeps_row_identity() {
        let (_dir, service) = service();
        let first = service.upsert(&Setting::new("k", "v1")).unwrap();
        let second = service.upsert(&Setting::new("k", "v2")).unwrap();
        assert_eq!(first, second);

        let rows = service.query(ResourceId::Collection, &Query::all()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, SettingValue::String("v2".into()));
    }

    #[test]
    fn test_upsert_rejects_empty_key() {
        let (_dir, service) = service();
        let err = service.upsert(&Setting::new("", 1i32)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_update_and_delete_count_changed_rows() {
        let (_dir, service) = service();
        let a = service.upsert(&Setting::new("a", 1i32)).unwrap();
        service.upsert(&Setting::new("b", 2i32)).unwrap();
        let events = record(&service);

        let key_a = Filter::Key("a".into());
        assert_eq!(
            service
                .update(ResourceId::Collection, &Setting::new("a", 10i32), Some(&key_a))
                .unwrap(),
            1
        );
        assert_eq!(
            service
                .update(ResourceId::item(999), &Setting::new("z", 1i32), None)
                .unwrap(),
            0
        );
        assert_eq!(service.delete(a, None).unwrap(), 1);
        assert_eq!(service.delete(a, None).unwrap(), 0);

        // Only calls that changed rows publish.
        assert_eq!(*events.lock().unwrap(), vec![a, a]);
    }

    #[test]
    fn test_delete_collection_publishes_each_row() {
        let (_dir, service) = service();
        let a = service.upsert(&Setting::new("a", 1i32)).unwrap();
        let b = service.upsert(&Setting::new("b", 2i32)).unwrap();
        let events = record(&service);

        assert_eq!(service.delete(ResourceId::Collection, None).unwrap(), 2);
        assert_eq!(*events.lock().unwrap(), vec![a, b]);
    }

    #[test]
    fn test_failed_call_publishes_nothing() {
        let (_dir, service) = service();
        service.insert(ResourceId::Collection, &Setting::new("a", 1i32)).unwrap();
        let events = record(&service);

        let err = service
            .insert(ResourceId::Collection, &Setting::new("a", 2i32))
            .unwrap_err();
        assert!(err.is_persistence());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_batch_closure_coalesces_calls() {
        let (_dir, service) = service();
        let events = record(&service);

        let seen_inside = service
            .batch(|service, ctx| {
                service.upsert_in(ctx, &Setting::new("a", true))?;
                service.upsert_in(ctx, &Setting::new("b", false))?;
                assert!(events.lock().unwrap().is_empty());
                service.query_in(ctx, ResourceId::Collection, &Query::all())
            })
            .unwrap();

        assert_eq!(seen_inside.len(), 2);
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_batch_closure_rolls_back() {
        let (_dir, service) = service();
        let result: Result<()> = service.batch(|service, ctx| {
            service.upsert_in(ctx, &Setting::new("a", true))?;
            Err(Error::InvalidArgument("stop".into()))
        });
        assert!(result.is_err());
        assert!(service
            .query(ResourceId::Collection, &Query::all())
            .unwrap()
            .is_empty());
    }
}
