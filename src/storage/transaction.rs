//! Write transactions.
//!
//! A [`TxContext`] owned by the caller carries at most one open
//! [`Transaction`]. The first operation started on an empty context begins a
//! storage transaction; nested operations started on the same context reuse
//! it, so an outer batch can wrap any number of single-operation calls and
//! commit them together.
//!
//! A transaction started by a batch caller is only closed by a batch caller.
//! Inner single-operation calls still mark it dirty but never commit it.
//!
//! Long batches may yield: commit the current segment, back off while other
//! writers are queued, then begin a new segment. Resources changed in a
//! segment committed by a yield are published when the transaction ends,
//! whether or not the final segment commits.

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::schema::apply_pragmas;
use crate::contract::ResourceId;
use crate::error::Result;
use crate::flow::notify::NotificationBus;
use crate::observability::metrics;

/// Pool of read-write connections.
pub type WriterPool = Pool<SqliteConnectionManager>;

/// Back-off slice while other writers are queued after a yield.
const BACK_OFF_SLICE: Duration = Duration::from_millis(30);

/// Open the pool of read-write connections.
///
/// The database must already exist with its schema; see
/// [`Storage::open`](super::Storage::open).
pub fn open_writer_pool<P: AsRef<Path>>(
    db_path: P,
    max_size: u32,
    busy_timeout: Duration,
) -> Result<WriterPool> {
    let manager = SqliteConnectionManager::file(db_path)
        .with_init(move |conn| apply_pragmas(conn, busy_timeout));
    let pool = Pool::builder().max_size(max_size).build(manager)?;
    Ok(pool)
}

/// Which long-running operation reached a yield point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YieldSource {
    Batch,
    BulkInsert,
}

impl YieldSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::BulkInsert => "bulk_insert",
        }
    }
}

/// A yield point reached by a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldPoint {
    pub source: YieldSource,
    /// Index of the operation or row about to be processed.
    pub index: usize,
    /// Whether the storage lock was actually released.
    pub released: bool,
}

/// Observer of every yield point.
pub type YieldHook = Arc<dyn Fn(&YieldPoint) + Send + Sync>;

/// An open storage transaction.
pub struct Transaction {
    conn: PooledConnection<SqliteConnectionManager>,
    batch: bool,
    successful: bool,
    yield_failed: bool,
    dirty: BTreeSet<ResourceId>,
    /// Resources of segments already committed by a yield.
    committed: BTreeSet<ResourceId>,
    yields: usize,
}

impl Transaction {
    fn new(conn: PooledConnection<SqliteConnectionManager>, batch: bool) -> Self {
        Self {
            conn,
            batch,
            successful: false,
            yield_failed: false,
            dirty: BTreeSet::new(),
            committed: BTreeSet::new(),
            yields: 0,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether a batch caller owns this transaction.
    pub fn is_batch(&self) -> bool {
        self.batch
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || !self.committed.is_empty()
    }

    pub fn mark_dirty(&mut self, resource: ResourceId) {
        self.dirty.insert(resource);
    }

    /// Resources changed so far, in every segment.
    pub fn dirty_resources(&self) -> BTreeSet<ResourceId> {
        self.committed.union(&self.dirty).copied().collect()
    }

    /// Mark the transaction for commit.
    ///
    /// Has no effect when a single-operation caller runs inside a batch;
    /// only the batch owner decides the outcome.
    pub fn mark_successful(&mut self, caller_is_batch: bool) {
        if !self.batch || caller_is_batch {
            self.successful = true;
        }
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn mark_yield_failed(&mut self) {
        self.yield_failed = true;
    }

    /// Number of yields that released the lock.
    pub fn yields(&self) -> usize {
        self.yields
    }

    /// Commit or roll back the current segment.
    fn finish(&mut self) -> Result<()> {
        if self.conn.is_autocommit() {
            if !self.yield_failed {
                tracing::warn!("Transaction ended outside of a storage transaction");
            }
            return Ok(());
        }

        if self.successful {
            self.conn.execute_batch("COMMIT")?;
        } else {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("batch", &self.batch)
            .field("successful", &self.successful)
            .field("yield_failed", &self.yield_failed)
            .field("dirty", &self.dirty)
            .field("committed", &self.committed)
            .field("yields", &self.yields)
            .finish()
    }
}

/// Carries the open transaction of one call chain.
#[derive(Debug, Default)]
pub struct TxContext {
    tx: Option<Transaction>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.tx.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.tx.as_mut()
    }
}

/// Decrements the waiting-writer count when dropped.
struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Begins, yields and ends transactions, and publishes their changes.
#[derive(Clone)]
pub struct TransactionManager {
    pool: WriterPool,
    bus: NotificationBus,
    waiting: Arc<AtomicUsize>,
    yield_sleep: Duration,
    yield_hook: Option<YieldHook>,
}

impl TransactionManager {
    pub fn new(pool: WriterPool, bus: NotificationBus, yield_sleep: Duration) -> Self {
        Self {
            pool,
            bus,
            waiting: Arc::new(AtomicUsize::new(0)),
            yield_sleep,
            yield_hook: None,
        }
    }

    /// Observe every yield point.
    pub fn set_yield_hook(&mut self, hook: YieldHook) {
        self.yield_hook = Some(hook);
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Number of threads currently waiting to begin a transaction.
    pub fn contention(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    fn is_contended(&self) -> bool {
        self.contention() > 0
    }

    /// Start a transaction on `ctx`, or join the one already open.
    pub fn start_transaction<'a>(
        &self,
        ctx: &'a mut TxContext,
        is_batch_caller: bool,
    ) -> Result<&'a mut Transaction> {
        let tx = match ctx.tx.take() {
            Some(tx) => tx,
            None => self.begin(is_batch_caller)?,
        };
        Ok(ctx.tx.insert(tx))
    }

    fn begin(&self, batch: bool) -> Result<Transaction> {
        let _waiting = WaitGuard::enter(&self.waiting);
        let conn = self.pool.get()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        tracing::trace!(batch, "Transaction started");
        Ok(Transaction::new(conn, batch))
    }

    /// End the transaction on `ctx` if this caller owns it.
    ///
    /// Commits when marked successful and rolls back otherwise. Changed
    /// resources are published after the connection is released, so
    /// observers may read or write from their callbacks.
    pub fn end_transaction(&self, ctx: &mut TxContext, is_batch_caller: bool) -> Result<()> {
        let owns = ctx
            .tx
            .as_ref()
            .is_some_and(|tx| !tx.is_batch() || is_batch_caller);
        if !owns {
            return Ok(());
        }
        let Some(mut tx) = ctx.tx.take() else {
            return Ok(());
        };

        let outcome = tx.finish();
        let mut published = std::mem::take(&mut tx.committed);
        if outcome.is_ok() && tx.successful {
            published.append(&mut tx.dirty);
        } else if !tx.dirty.is_empty() {
            tracing::debug!(
                discarded = tx.dirty.len(),
                "Transaction rolled back, changes not published"
            );
        }
        drop(tx);

        if !published.is_empty() {
            let delivered = self.bus.notify_all(published.iter().copied());
            tracing::debug!(
                resources = published.len(),
                delivered,
                "Published changed resources"
            );
        }
        outcome
    }

    /// Give other writers a chance to run.
    ///
    /// Releases the lock only if another thread is waiting to begin a
    /// transaction. Returns whether the lock was released. On failure the
    /// transaction is marked so that ending it does not close a storage
    /// transaction it no longer holds.
    pub fn yield_transaction(
        &self,
        tx: &mut Transaction,
        source: YieldSource,
        index: usize,
    ) -> Result<bool> {
        let released = if self.is_contended() {
            if let Err(e) = self.release_and_reacquire(tx) {
                tx.mark_yield_failed();
                tracing::warn!(source = source.as_str(), index, error = %e, "Yield failed");
                return Err(e);
            }
            true
        } else {
            false
        };

        metrics::record_yield(source.as_str(), released);
        if let Some(hook) = &self.yield_hook {
            hook(&YieldPoint {
                source,
                index,
                released,
            });
        }
        Ok(released)
    }

    fn release_and_reacquire(&self, tx: &mut Transaction) -> Result<()> {
        tx.conn.execute_batch("COMMIT")?;
        let mut segment = std::mem::take(&mut tx.dirty);
        tx.committed.append(&mut segment);
        tx.yields += 1;

        self.back_off();

        let _waiting = WaitGuard::enter(&self.waiting);
        tx.conn.execute_batch("BEGIN IMMEDIATE")?;
        tracing::debug!(yields = tx.yields, "Transaction yielded");
        Ok(())
    }

    fn back_off(&self) {
        let deadline = Instant::now() + self.yield_sleep;
        while self.is_contended() && Instant::now() < deadline {
            thread::sleep(BACK_OFF_SLICE);
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("pool", &self.pool.state())
            .field("waiting", &self.contention())
            .field("yield_sleep", &self.yield_sleep)
            .finish()
    }
}
