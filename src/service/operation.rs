//! Operations applied as one batch.

use crate::contract::ResourceId;
use crate::setting::Setting;
use crate::storage::store::Filter;

/// What an [`Operation`] does to its target.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationKind {
    /// Insert a new row into the collection.
    Insert(Setting),
    /// Overwrite key, type and value of every matching row.
    Update {
        values: Setting,
        filter: Option<Filter>,
    },
    /// Delete every matching row.
    Delete { filter: Option<Filter> },
    /// Update the row holding the setting's key, or insert one.
    Upsert(Setting),
}

/// One step of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub resource: ResourceId,
    pub kind: OperationKind,
    /// Whether the batch may yield before applying this operation.
    pub yield_allowed: bool,
}

impl Operation {
    fn new(resource: ResourceId, kind: OperationKind) -> Self {
        Self {
            resource,
            kind,
            yield_allowed: false,
        }
    }

    pub fn insert(setting: Setting) -> Self {
        Self::new(ResourceId::Collection, OperationKind::Insert(setting))
    }

    pub fn update(resource: ResourceId, values: Setting) -> Self {
        Self::new(
            resource,
            OperationKind::Update {
                values,
                filter: None,
            },
        )
    }

    pub fn delete(resource: ResourceId) -> Self {
        Self::new(resource, OperationKind::Delete { filter: None })
    }

    /// Delete the row holding `key`, if any.
    pub fn delete_key(key: impl Into<String>) -> Self {
        Self::new(
            ResourceId::Collection,
            OperationKind::Delete {
                filter: Some(Filter::Key(key.into())),
            },
        )
    }

    pub fn upsert(setting: Setting) -> Self {
        Self::new(ResourceId::Collection, OperationKind::Upsert(setting))
    }

    /// Restrict an update or delete to rows matching `filter`.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        match &mut self.kind {
            OperationKind::Update { filter: f, .. } | OperationKind::Delete { filter: f } => {
                *f = Some(filter);
            }
            OperationKind::Insert(_) | OperationKind::Upsert(_) => {}
        }
        self
    }

    /// Declare a yield point before this operation.
    pub fn with_yield_allowed(mut self) -> Self {
        self.yield_allowed = true;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OperationKind::Insert(_) => "insert",
            OperationKind::Update { .. } => "update",
            OperationKind::Delete { .. } => "delete",
            OperationKind::Upsert(_) => "upsert",
        }
    }
}

/// Outcome of one applied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResult {
    /// The inserted or upserted row, or the target of an update or delete.
    pub resource: ResourceId,
    /// Rows affected.
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_applies_to_update_and_delete_only() {
        let delete = Operation::delete(ResourceId::Collection).with_filter(Filter::Key("k".into()));
        assert_eq!(
            delete.kind,
            OperationKind::Delete {
                filter: Some(Filter::Key("k".into()))
            }
        );

        let insert = Operation::insert(Setting::new("k", 1i32)).with_filter(Filter::Id(1));
        assert_eq!(insert.kind, OperationKind::Insert(Setting::new("k", 1i32)));
    }

    #[test]
    fn test_yield_allowed_is_opt_in() {
        let op = Operation::upsert(Setting::new("k", true));
        assert!(!op.yield_allowed);
        assert!(op.with_yield_allowed().yield_allowed);
    }
}
