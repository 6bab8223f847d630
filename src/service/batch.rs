//! Batch application and bulk insert.
//!
//! Both run as one batch transaction and publish their changes once. Bulk
//! insert yields every [`BULK_INSERTS_PER_YIELD_POINT`] rows. A batch yields
//! only before operations that allow it, and fails with
//! [`Error::Contention`] when [`MAX_OPERATIONS_PER_YIELD_POINT`] operations
//! are reached without one.

use super::operation::{Operation, OperationKind, OperationResult};
use super::SettingsService;
use crate::contract::ResourceId;
use crate::error::{Error, Result};
use crate::observability::metrics;
use crate::setting::Setting;
use crate::storage::transaction::{TxContext, YieldSource};

/// Operations a batch may run between yield points.
pub const MAX_OPERATIONS_PER_YIELD_POINT: usize = 500;

/// Rows a bulk insert writes between yield points.
pub const BULK_INSERTS_PER_YIELD_POINT: usize = 50;

impl SettingsService {
    /// Apply `operations` in order as one batch on `ctx`.
    ///
    /// Nothing of a failed batch is published except segments already
    /// committed by a yield.
    pub fn apply_batch_in(
        &self,
        ctx: &mut TxContext,
        operations: &[Operation],
    ) -> Result<Vec<OperationResult>> {
        let span = tracing::debug_span!("apply_batch", operations = operations.len());
        let _enter = span.enter();

        self.in_batch(ctx, |ctx| self.apply_operations(ctx, operations))
    }

    fn apply_operations(
        &self,
        ctx: &mut TxContext,
        operations: &[Operation],
    ) -> Result<Vec<OperationResult>> {
        let mut results = Vec::with_capacity(operations.len());
        let mut yield_points = 0;
        let mut op_count = 0;

        for (i, operation) in operations.iter().enumerate() {
            op_count += 1;
            if op_count >= MAX_OPERATIONS_PER_YIELD_POINT {
                metrics::record_contention_failure();
                tracing::warn!(
                    index = i,
                    yield_points,
                    "Too many operations between yield points"
                );
                return Err(Error::Contention { yield_points });
            }

            if i > 0 && operation.yield_allowed {
                op_count = 0;
                let tx = self.transactions().start_transaction(ctx, true)?;
                if self
                    .transactions()
                    .yield_transaction(tx, YieldSource::Batch, i)?
                {
                    yield_points += 1;
                }
            }

            results.push(self.apply_operation(ctx, operation)?);
        }
        Ok(results)
    }

    fn apply_operation(&self, ctx: &mut TxContext, operation: &Operation) -> Result<OperationResult> {
        let resource = operation.resource;
        let result = match &operation.kind {
            OperationKind::Insert(setting) => OperationResult {
                resource: self.insert_in(ctx, resource, setting)?,
                count: 1,
            },
            OperationKind::Update { values, filter } => OperationResult {
                resource,
                count: self.update_in(ctx, resource, values, filter.as_ref())?,
            },
            OperationKind::Delete { filter } => OperationResult {
                resource,
                count: self.delete_in(ctx, resource, filter.as_ref())?,
            },
            OperationKind::Upsert(setting) => OperationResult {
                resource: self.upsert_in(ctx, setting)?,
                count: 1,
            },
        };
        tracing::trace!(kind = operation.kind_name(), %resource, count = result.count, "Applied operation");
        Ok(result)
    }

    /// Insert every setting into the collection as one batch on `ctx`.
    pub fn bulk_insert_in(
        &self,
        ctx: &mut TxContext,
        resource: ResourceId,
        settings: &[Setting],
    ) -> Result<usize> {
        if !resource.is_collection() {
            return Err(Error::InvalidResource(self.contract().uri(&resource)));
        }
        let span = tracing::debug_span!("bulk_insert", rows = settings.len());
        let _enter = span.enter();

        self.in_batch(ctx, |ctx| {
            let mut op_count = 0;
            for (i, setting) in settings.iter().enumerate() {
                self.insert_in(ctx, resource, setting)?;

                op_count += 1;
                if op_count >= BULK_INSERTS_PER_YIELD_POINT {
                    op_count = 0;
                    let tx = self.transactions().start_transaction(ctx, true)?;
                    self.transactions()
                        .yield_transaction(tx, YieldSource::BulkInsert, i + 1)?;
                }
            }
            Ok(settings.len())
        })
    }
}
