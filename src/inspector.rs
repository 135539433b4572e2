//! Read-only reflection of a live SQL connection.
//!
//! [`DbInspector`] exposes table, column, primary-key and foreign-key metadata;
//! [`RowReader`] streams the values of selected columns. [`SqliteSource`]
//! implements both over a SQLite file opened read-only.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::storage::Dialect;

// ============================================================================
// Metadata types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Storage type exactly as declared in the source DDL.
    pub declared_type: String,
    pub nullable: bool,
    /// 1-based position within the primary key, if the column is part of it.
    pub pk_position: Option<u32>,
}

/// The table (and, when resolvable, the columns) a foreign key points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyConstraint {
    pub ref_table: String,
    pub ref_columns: Option<Vec<String>>,
}

/// A single cell read from the source.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(v: ValueRef<'_>) -> Self {
        match v {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(f) => SqlValue::Real(f),
            ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Metadata reflection over a database connection. Implementations must not
/// modify the database.
///
/// Composite keys are reported as they are; callers that only support
/// single-column keys skip them.
pub trait DbInspector {
    fn dialect(&self) -> Dialect;

    /// Table names in a deterministic order.
    fn tables(&self) -> crate::Result<Vec<String>>;

    /// Columns of `table` in declaration order.
    fn columns(&self, table: &str) -> crate::Result<Vec<ColumnInfo>>;

    /// Primary-key column names of `table`, in key order. Empty if the table
    /// has no declared primary key.
    fn primary_key(&self, table: &str) -> crate::Result<Vec<String>> {
        let mut pk: Vec<(u32, String)> = self
            .columns(table)?
            .into_iter()
            .filter_map(|c| c.pk_position.map(|p| (p, c.name)))
            .collect();
        pk.sort_by_key(|(p, _)| *p);
        Ok(pk.into_iter().map(|(_, name)| name).collect())
    }

    /// Foreign keys of `table`, keyed by the ordered tuple of local columns.
    fn foreign_keys(
        &self,
        table: &str,
    ) -> crate::Result<IndexMap<Vec<String>, ForeignKeyConstraint>>;

    fn row_count(&self, table: &str) -> crate::Result<u64>;
}

/// Row access for sampling and downloading.
pub trait RowReader {
    /// Call `f` once per row of `table` with the values of `columns`, in
    /// the source's scan order.
    fn for_each_row(
        &self,
        table: &str,
        columns: &[String],
        f: &mut dyn FnMut(Vec<SqlValue>) -> crate::Result<()>,
    ) -> crate::Result<()>;
}

// ============================================================================
// SQLite
// ============================================================================

/// Quote an identifier for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A read-only SQLite database.
///
/// The connection lives exactly as long as this value: dropping it (or
/// calling [`close`](Self::close)) releases it.
pub struct SqliteSource {
    conn: Connection,
    path: PathBuf,
}

impl SqliteSource {
    /// Open a source from a `sqlite://<path>` URI or a plain file path.
    pub fn open(uri: &str) -> crate::Result<Self> {
        let path = PathBuf::from(uri.strip_prefix("sqlite://").unwrap_or(uri));
        Self::open_path(&path)
    }

    pub fn open_path(path: &Path) -> crate::Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        debug!("Opened source {}", path.display());
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the connection, reporting any error from closing it.
    pub fn close(self) -> crate::Result<()> {
        self.conn.close().map_err(|(_, e)| e)?;
        debug!("Closed source {}", self.path.display());
        Ok(())
    }
}

impl DbInspector for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn tables(&self) -> crate::Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn columns(&self, table: &str) -> crate::Result<Vec<ColumnInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let cols = stmt
            .query_map([table], |row| {
                let pk: u32 = row.get(3)?;
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    declared_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    nullable: row.get::<_, i64>(2)? == 0,
                    pk_position: (pk > 0).then_some(pk),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cols)
    }

    fn foreign_keys(
        &self,
        table: &str,
    ) -> crate::Result<IndexMap<Vec<String>, ForeignKeyConstraint>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) \
             ORDER BY id, seq",
        )?;
        let rows = stmt
            .query_map([table], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        // Group the per-column rows of each constraint id.
        let mut grouped: IndexMap<i64, (String, Vec<String>, Vec<Option<String>>)> =
            IndexMap::new();
        for (id, ref_table, from, to) in rows {
            let entry = grouped
                .entry(id)
                .or_insert_with(|| (ref_table, Vec::new(), Vec::new()));
            entry.1.push(from);
            entry.2.push(to);
        }

        let known_tables = self.tables()?;
        let mut out = IndexMap::new();
        for (_, (ref_table, from, to)) in grouped {
            let ref_columns = if to.iter().all(Option::is_some) {
                Some(to.into_iter().flatten().collect())
            } else if known_tables.contains(&ref_table) {
                // Implicit reference to the referenced table's primary key.
                let pk = self.primary_key(&ref_table)?;
                (pk.len() == from.len()).then_some(pk)
            } else {
                None
            };
            out.insert(
                from,
                ForeignKeyConstraint {
                    ref_table,
                    ref_columns,
                },
            );
        }
        Ok(out)
    }

    fn row_count(&self, table: &str) -> crate::Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

impl RowReader for SqliteSource {
    fn for_each_row(
        &self,
        table: &str,
        columns: &[String],
        f: &mut dyn FnMut(Vec<SqlValue>) -> crate::Result<()>,
    ) -> crate::Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let projection: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "SELECT {} FROM {}",
            projection.join(", "),
            quote_ident(table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(SqlValue::from(row.get_ref(i)?));
            }
            f(values)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a small SQLite file with composite and implicit foreign keys.
    pub(crate) fn fixture_db(dir: &Path) -> PathBuf {
        let path = dir.join("shop.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE customers (
                id INTEGER PRIMARY KEY,
                name VARCHAR(64) NOT NULL
            );
            CREATE TABLE orders (
                id INTEGER PRIMARY KEY,
                customer_id INTEGER REFERENCES customers(id),
                amount DOUBLE
            );
            CREATE TABLE shipments (
                order_id INTEGER,
                line INTEGER,
                carrier TEXT,
                PRIMARY KEY (order_id, line)
            );
            CREATE TABLE tracking (
                order_id INTEGER,
                line INTEGER,
                customer INTEGER REFERENCES customers,
                FOREIGN KEY (order_id, line) REFERENCES shipments (order_id, line)
            );
            INSERT INTO customers VALUES (1, 'ada'), (2, 'grace');
            INSERT INTO orders VALUES (10, 1, 5.5), (11, 2, 7.0), (12, 1, NULL);
            "#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_tables_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open(&format!("sqlite://{}", fixture_db(dir.path()).display()))
            .unwrap();
        assert_eq!(
            src.tables().unwrap(),
            ["customers", "orders", "shipments", "tracking"]
        );
        let cols = src.columns("customers").unwrap();
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[0].pk_position, Some(1));
        assert_eq!(cols[1].declared_type, "VARCHAR(64)");
        assert!(!cols[1].nullable);
        assert_eq!(src.row_count("orders").unwrap(), 3);
    }

    #[test]
    fn test_composite_primary_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();
        assert_eq!(src.primary_key("shipments").unwrap(), ["order_id", "line"]);
        assert_eq!(src.primary_key("customers").unwrap(), ["id"]);
        assert!(src.primary_key("tracking").unwrap().is_empty());
    }

    #[test]
    fn test_foreign_keys_surface_composite_and_implicit_targets() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();

        let fks = src.foreign_keys("orders").unwrap();
        assert_eq!(fks.len(), 1);
        let fk = &fks[&vec!["customer_id".to_string()]];
        assert_eq!(fk.ref_table, "customers");
        assert_eq!(fk.ref_columns.as_deref(), Some(&["id".to_string()][..]));

        let fks = src.foreign_keys("tracking").unwrap();
        assert_eq!(fks.len(), 2);
        let composite = &fks[&vec!["order_id".to_string(), "line".to_string()]];
        assert_eq!(composite.ref_table, "shipments");
        // `REFERENCES customers` without columns resolves to the primary key.
        let implicit = &fks[&vec!["customer".to_string()]];
        assert_eq!(implicit.ref_columns, Some(vec!["id".to_string()]));
    }

    #[test]
    fn test_for_each_row_streams_values() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();
        let mut rows = Vec::new();
        src.for_each_row("orders", &["id".into(), "amount".into()], &mut |r| {
            rows.push(r);
            Ok(())
        })
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![SqlValue::Integer(10), SqlValue::Real(5.5)]);
        assert!(rows[2][1].is_null());
        src.close().unwrap();
    }

    #[test]
    fn test_source_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();
        let err = src.conn.execute("DELETE FROM orders", []);
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SqliteSource::open_path(&dir.path().join("nope.sqlite")).is_err());
    }
}
