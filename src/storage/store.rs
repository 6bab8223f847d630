//! Row operations on the settings table.
//!
//! Every function works on a borrowed connection so the same code runs on a
//! pooled read connection or inside an open write transaction.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use crate::contract::columns;
use crate::error::{Error, Result};
use crate::setting::{RawSetting, Setting};

/// Row filter of a query, update or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Key(String),
    Id(i64),
}

/// Row order of a query, by row id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    IdAscending,
    IdDescending,
}

/// A query against the settings table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub order: SortOrder,
    pub limit: Option<u32>,
}

impl Query {
    /// Every row, oldest first.
    pub fn all() -> Self {
        Self::default()
    }

    /// The newest row for a key.
    ///
    /// The unique constraint allows at most one row per key; ordering by id
    /// and keeping one row still picks a single winner if that ever breaks.
    pub fn by_key(key: impl Into<String>) -> Self {
        Self::all()
            .filter(Filter::Key(key.into()))
            .order(SortOrder::IdDescending)
            .limit(1)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Build a `WHERE` clause from an optional row id and filter.
fn selection(row_id: Option<i64>, filter: Option<&Filter>) -> (String, Vec<Value>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    if let Some(id) = row_id {
        conditions.push(format!("{} = ?", columns::ID));
        args.push(Value::Integer(id));
    }
    match filter {
        Some(Filter::Key(key)) => {
            conditions.push(format!("{} = ?", columns::KEY));
            args.push(Value::Text(key.clone()));
        }
        Some(Filter::Id(id)) => {
            conditions.push(format!("{} = ?", columns::ID));
            args.push(Value::Integer(*id));
        }
        None => {}
    }

    if conditions.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), args)
    }
}

/// Query rows, optionally restricted to one row id.
pub fn select(conn: &Connection, row_id: Option<i64>, query: &Query) -> Result<Vec<Setting>> {
    let (clause, args) = selection(row_id, query.filter.as_ref());
    let order = match query.order {
        SortOrder::IdAscending => "ASC",
        SortOrder::IdDescending => "DESC",
    };
    let mut sql = format!(
        "SELECT id, key, type, value FROM settings{clause} ORDER BY id {order}"
    );
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare_cached(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(args.iter()), RawSetting::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter().map(RawSetting::decode).collect()
}

/// Ids of the rows matching a selection, ascending.
pub fn select_ids(conn: &Connection, row_id: Option<i64>, filter: Option<&Filter>) -> Result<Vec<i64>> {
    let (clause, args) = selection(row_id, filter);
    let sql = format!("SELECT id FROM settings{clause} ORDER BY id ASC");
    let mut stmt = conn.prepare_cached(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(args.iter()), |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Id of the newest row holding `key`.
///
/// Reads ids only, so a row whose value no longer decodes is still found.
pub fn find_id_by_key(conn: &Connection, key: &str) -> Result<Option<i64>> {
    let mut stmt =
        conn.prepare_cached("SELECT id FROM settings WHERE key = ?1 ORDER BY id DESC LIMIT 1")?;
    let mut ids = stmt.query_map([key], |row| row.get::<_, i64>(0))?;
    Ok(ids.next().transpose()?)
}

fn validate(setting: &Setting) -> Result<()> {
    if setting.key.is_empty() {
        return Err(Error::InvalidArgument("setting key must not be empty".into()));
    }
    Ok(())
}

/// Insert a new row, returning its id.
///
/// The row id of `setting` is ignored; the store assigns one.
pub fn insert(conn: &Connection, setting: &Setting) -> Result<i64> {
    validate(setting)?;
    let value = setting.value.encode()?;
    conn.prepare_cached("INSERT INTO settings (key, type, value) VALUES (?1, ?2, ?3)")?
        .execute(params![setting.key, setting.value_type().tag(), value])?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite key, type and value of one row. The row id never changes.
pub fn update_by_id(conn: &Connection, id: i64, values: &Setting) -> Result<usize> {
    validate(values)?;
    let value = values.value.encode()?;
    let changed = conn
        .prepare_cached("UPDATE settings SET key = ?1, type = ?2, value = ?3 WHERE id = ?4")?
        .execute(params![values.key, values.value_type().tag(), value, id])?;
    Ok(changed)
}

pub fn delete_by_id(conn: &Connection, id: i64) -> Result<usize> {
    let changed = conn
        .prepare_cached("DELETE FROM settings WHERE id = ?1")?
        .execute([id])?;
    Ok(changed)
}

/// Delete every row, returning the ids that were removed.
pub fn delete_all(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached("DELETE FROM settings RETURNING id")?;
    let mut ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting::SettingValue;
    use crate::storage::schema::initialize_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        initialize_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let conn = conn();
        let a = insert(&conn, &Setting::new("a", 1i32)).unwrap();
        let b = insert(&conn, &Setting::new("b", 2i32)).unwrap();
        assert!(b > a);
        let rows = select(&conn, Some(b), &Query::all()).unwrap();
        assert_eq!(rows[0].key, "b");
    }

    #[test]
    fn test_insert_rejects_empty_key() {
        let conn = conn();
        let err = insert(&conn, &Setting::new("", 1i32)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_duplicate_key_is_a_persistence_error() {
        let conn = conn();
        insert(&conn, &Setting::new("a", 1i32)).unwrap();
        let err = insert(&conn, &Setting::new("a", 2i32)).unwrap_err();
        assert!(err.is_persistence());
    }

    #[test]
    fn test_update_keeps_id_and_changes_type() {
        let conn = conn();
        let id = insert(&conn, &Setting::new("a", 1i32)).unwrap();
        assert_eq!(update_by_id(&conn, id, &Setting::new("a", "one")).unwrap(), 1);

        let stored = select(&conn, None, &Query::by_key("a")).unwrap().remove(0);
        assert_eq!(stored.id, id);
        assert_eq!(stored.value, SettingValue::String("one".into()));
    }

    #[test]
    fn test_update_missing_row_changes_nothing() {
        let conn = conn();
        assert_eq!(update_by_id(&conn, 99, &Setting::new("a", 1i32)).unwrap(), 0);
    }

    #[test]
    fn test_select_with_filter_order_and_limit() {
        let conn = conn();
        for key in ["a", "b", "c"] {
            insert(&conn, &Setting::new(key, true)).unwrap();
        }

        let newest = select(&conn, None, &Query::all().order(SortOrder::IdDescending).limit(2))
            .unwrap();
        let keys: Vec<_> = newest.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "b"]);

        let only_b = select(&conn, None, &Query::all().filter(Filter::Key("b".into()))).unwrap();
        assert_eq!(only_b.len(), 1);
    }

    #[test]
    fn test_item_selection_combines_with_filter() {
        let conn = conn();
        let a = insert(&conn, &Setting::new("a", 1i64)).unwrap();
        insert(&conn, &Setting::new("b", 2i64)).unwrap();

        assert_eq!(select_ids(&conn, Some(a), Some(&Filter::Key("a".into()))).unwrap(), vec![a]);
        assert!(select_ids(&conn, Some(a), Some(&Filter::Key("b".into()))).unwrap().is_empty());
    }

    #[test]
    fn test_delete_all_reports_removed_ids() {
        let conn = conn();
        let a = insert(&conn, &Setting::new("a", 1i32)).unwrap();
        let b = insert(&conn, &Setting::new("b", 1i32)).unwrap();

        assert_eq!(delete_all(&conn).unwrap(), vec![a, b]);
        assert!(delete_all(&conn).unwrap().is_empty());
        assert_eq!(delete_by_id(&conn, a).unwrap(), 0);
    }

    #[test]
    fn test_undecodable_row_surfaces_serialization_error() {
        let conn = conn();
        conn.execute(
            "INSERT INTO settings (key, type, value) VALUES ('bad', 'bool', 'maybe')",
            [],
        )
        .unwrap();
        let err = select(&conn, None, &Query::by_key("bad")).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        // The id is still reachable for overwriting the row.
        assert!(find_id_by_key(&conn, "bad").unwrap().is_some());
        assert_eq!(find_id_by_key(&conn, "missing").unwrap(), None);
    }
}
