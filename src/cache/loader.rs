//! Loads cache contents through a [`Resolver`].

use std::collections::HashMap;
use std::time::Instant;

use crate::contract::ResourceId;
use crate::error::Result;
use crate::service::Resolver;
use crate::setting::Setting;
use crate::storage::store::Query;

/// Every setting in the collection, keyed by row id.
pub fn load_all(resolver: &dyn Resolver) -> Result<HashMap<i64, Setting>> {
    let started = Instant::now();
    let settings = resolver.query(ResourceId::Collection, &Query::all())?;
    let loaded: HashMap<i64, Setting> = settings.into_iter().map(|s| (s.id, s)).collect();
    tracing::debug!(
        rows = loaded.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded settings"
    );
    Ok(loaded)
}

/// The current row behind an item resource, or `None` if it is gone.
pub fn load_item(resolver: &dyn Resolver, id: i64) -> Result<Option<Setting>> {
    Ok(resolver
        .query(ResourceId::item(id), &Query::all())?
        .into_iter()
        .next())
}

/// The newest row holding `key`, if any.
pub fn load_key(resolver: &dyn Resolver, key: &str) -> Result<Option<Setting>> {
    Ok(resolver
        .query(ResourceId::Collection, &Query::by_key(key))?
        .into_iter()
        .next())
}
