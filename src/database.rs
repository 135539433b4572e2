//! In-memory tables downloaded from a source database, and their Parquet cache.
//!
//! Every [`Table`] is one Arrow [`RecordBatch`]; a row's [`RowIdx`] is its
//! position in the batch. The primary-key column and the foreign-key →
//! referenced-table mapping travel with the table, and are stored in the
//! Arrow schema metadata of the cached Parquet file.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;

use arrow::array::*;
use arrow::compute::concat_batches;
use arrow::datatypes::{DataType, Field, Int32Type, Schema as ArrowSchema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, Datelike};
use indexmap::IndexMap;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::{debug, info, warn};

use crate::common::{RowIdx, progress_bar};
use crate::inspector::{DbInspector, RowReader, SqlValue};
use crate::storage;
use crate::stype::{parse_date, parse_datetime};

const PKEY_META_KEY: &str = "relgraph:pkey_col";
const FKEY_META_KEY: &str = "relgraph:fkey_col_to_pkey_table";

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub batch: RecordBatch,
    /// Single-column primary key, if the table has one.
    pub pkey_col: Option<String>,
    /// Single-column foreign keys: local column → referenced table.
    pub fkey_col_to_pkey_table: IndexMap<String, String>,
}

impl Table {
    pub fn new(
        batch: RecordBatch,
        pkey_col: Option<String>,
        fkey_col_to_pkey_table: IndexMap<String, String>,
    ) -> Self {
        Self {
            batch,
            pkey_col,
            fkey_col_to_pkey_table,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn column(&self, name: &str) -> Option<&ArrayRef> {
        self.batch.column_by_name(name)
    }

    /// Row identifiers in table order. `None` if the table has more rows
    /// than a [`RowIdx`] can address.
    pub fn row_ids(&self) -> Option<impl Iterator<Item = RowIdx> + use<>> {
        let n = u32::try_from(self.num_rows()).ok()?;
        Some((0..n).map(RowIdx))
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let mut metadata = HashMap::new();
        if let Some(pk) = &self.pkey_col {
            metadata.insert(PKEY_META_KEY.to_string(), pk.clone());
        }
        metadata.insert(
            FKEY_META_KEY.to_string(),
            serde_json::to_string(&self.fkey_col_to_pkey_table)?,
        );
        let schema = Arc::new(self.batch.schema().as_ref().clone().with_metadata(metadata));
        let batch = self.batch.clone().with_schema(schema.clone())?;

        let file = File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.with_batch_size(1_000_000).build()?;
        let batches: Vec<RecordBatch> = reader.collect::<Result<Vec<_>, _>>()?;
        let batch = concat_batches(&schema, &batches)?;

        let metadata = schema.metadata();
        let pkey_col = metadata.get(PKEY_META_KEY).cloned();
        let fkey_col_to_pkey_table = match metadata.get(FKEY_META_KEY) {
            Some(json) => serde_json::from_str(json)?,
            None => {
                return Err(crate::Error::Format {
                    path: path.to_path_buf(),
                    reason: format!("missing schema metadata key {FKEY_META_KEY}"),
                });
            }
        };

        let plain = Arc::new(schema.as_ref().clone().with_metadata(HashMap::new()));
        let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
        Ok(Self {
            batch: RecordBatch::try_new_with_options(plain, batch.columns().to_vec(), &options)?,
            pkey_col,
            fkey_col_to_pkey_table,
        })
    }
}

// ============================================================================
// Database
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    tables: IndexMap<String, Table>,
}

impl FromIterator<(String, Table)> for Database {
    fn from_iter<I: IntoIterator<Item = (String, Table)>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}

impl Database {
    pub fn new(tables: IndexMap<String, Table>) -> Self {
        Self { tables }
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Table)> {
        self.tables.iter()
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Table::num_rows).sum()
    }

    /// Download every table of `source`.
    ///
    /// Composite primary and foreign keys are not recorded on the tables.
    pub fn download<S: DbInspector + RowReader>(source: &S, progress: bool) -> crate::Result<Self> {
        let names = source.tables()?;
        let pb = progress_bar(
            names.len() as u64,
            "  Downloading {bar:40.cyan/blue} {pos}/{len} tables [{elapsed_precise}] {msg}",
            progress,
        );

        let mut tables = IndexMap::with_capacity(names.len());
        for name in names {
            pb.set_message(name.clone());

            let pk = source.primary_key(&name)?;
            let pkey_col = match pk.len() {
                0 => None,
                1 => pk.into_iter().next(),
                _ => {
                    warn!("{name}: composite primary key ({}) is not recorded", pk.join(", "));
                    None
                }
            };

            let mut fkeys = IndexMap::new();
            for (columns, constraint) in source.foreign_keys(&name)? {
                match <[String; 1]>::try_from(columns) {
                    Ok([column]) => {
                        fkeys.insert(column, constraint.ref_table);
                    }
                    Err(columns) => warn!(
                        "{name}: composite foreign key ({}) -> {} is not recorded",
                        columns.join(", "),
                        constraint.ref_table
                    ),
                }
            }

            let batch = download_table(source, &name)?;
            debug!("  {name}: {} rows, {} columns", batch.num_rows(), batch.num_columns());
            tables.insert(name, Table::new(batch, pkey_col, fkeys));
            pb.inc(1);
        }
        pb.finish_and_clear();

        let db = Self { tables };
        info!(
            "  Downloaded {} tables, {} rows",
            db.len(),
            indicatif::HumanCount(db.total_rows() as u64)
        );
        Ok(db)
    }

    /// Write every table to `<dir>/<table>.parquet`.
    pub fn save(&self, dir: &Path) -> crate::Result<()> {
        fs::create_dir_all(dir)?;
        for (name, table) in &self.tables {
            table.save(&dir.join(format!("{name}.parquet")))?;
        }
        Ok(())
    }

    /// Load the named tables from `<dir>/<table>.parquet`.
    pub fn load<'a>(dir: &Path, names: impl IntoIterator<Item = &'a str>) -> crate::Result<Self> {
        names
            .into_iter()
            .map(|name| {
                let table = Table::load(&dir.join(format!("{name}.parquet")))?;
                Ok((name.to_string(), table))
            })
            .collect()
    }
}

// ============================================================================
// Download
// ============================================================================

/// Read every column of `table` into Arrow arrays of the mapped storage types.
fn download_table<S: DbInspector + RowReader>(source: &S, table: &str) -> crate::Result<RecordBatch> {
    let columns = source.columns(table)?;
    let dialect = source.dialect();

    let mut targets = Vec::with_capacity(columns.len());
    let mut builders = Vec::with_capacity(columns.len());
    for col in &columns {
        let class = storage::classify(&col.declared_type, dialect);
        let dt = class.arrow_type().unwrap_or_else(|| {
            warn!(
                "{table}.{}: unknown data type '{}', storing as text",
                col.name, col.declared_type
            );
            DataType::Utf8
        });
        builders.push(ColumnBuilder::for_type(&dt));
        targets.push(dt);
    }

    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    let mut failed = vec![0usize; names.len()];
    source.for_each_row(table, &names, &mut |row| {
        for ((builder, value), failed) in builders.iter_mut().zip(row).zip(failed.iter_mut()) {
            if !builder.push(value) {
                *failed += 1;
            }
        }
        Ok(())
    })?;

    let mut fields = Vec::with_capacity(names.len());
    let mut arrays = Vec::with_capacity(names.len());
    for (((name, dt), builder), failed) in names.iter().zip(targets).zip(builders).zip(failed) {
        let (array, lost) = builder.finish(&dt)?;
        let lost = failed + lost;
        if lost > 0 {
            warn!("{table}.{name}: {lost} values could not be converted to {dt} and are null");
        }
        fields.push(Field::new(name, dt, true));
        arrays.push(array);
    }

    let num_rows = arrays.first().map_or(0, |a| a.len());
    let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(ArrowSchema::new(fields)),
        arrays,
        &options,
    )?)
}

/// Accumulates one column's values in the representation of its storage class.
enum ColumnBuilder {
    Int(Vec<Option<i64>>),
    Float(Vec<Option<f64>>),
    Bool(Vec<Option<bool>>),
    Date(Vec<Option<i32>>),
    DateTime(Vec<Option<i64>>),
    Utf8(Vec<Option<String>>),
    Enum(StringDictionaryBuilder<Int32Type>),
    Binary(Vec<Option<Vec<u8>>>),
}

impl ColumnBuilder {
    fn for_type(dt: &DataType) -> Self {
        match dt {
            dt if dt.is_integer() => ColumnBuilder::Int(Vec::new()),
            dt if dt.is_floating() => ColumnBuilder::Float(Vec::new()),
            DataType::Boolean => ColumnBuilder::Bool(Vec::new()),
            DataType::Date32 => ColumnBuilder::Date(Vec::new()),
            DataType::Timestamp(_, _) => ColumnBuilder::DateTime(Vec::new()),
            DataType::Dictionary(_, _) => ColumnBuilder::Enum(StringDictionaryBuilder::new()),
            DataType::Binary => ColumnBuilder::Binary(Vec::new()),
            _ => ColumnBuilder::Utf8(Vec::new()),
        }
    }

    /// Append `value`; returns false if it could not be converted and a null
    /// was appended instead.
    fn push(&mut self, value: SqlValue) -> bool {
        if value.is_null() {
            self.push_null();
            return true;
        }
        match self {
            ColumnBuilder::Int(v) => push_opt(v, to_i64(&value)),
            ColumnBuilder::Float(v) => push_opt(v, to_f64(&value)),
            ColumnBuilder::Bool(v) => push_opt(v, to_bool(&value)),
            ColumnBuilder::Date(v) => push_opt(v, to_date32(&value)),
            ColumnBuilder::DateTime(v) => push_opt(v, to_timestamp_us(&value)),
            ColumnBuilder::Utf8(v) => push_opt(v, Some(to_text(value))),
            ColumnBuilder::Enum(b) => match b.append(to_text(value)) {
                Ok(_) => true,
                Err(_) => {
                    b.append_null();
                    false
                }
            },
            ColumnBuilder::Binary(v) => push_opt(v, to_bytes(value)),
        }
    }

    fn push_null(&mut self) {
        match self {
            ColumnBuilder::Int(v) => v.push(None),
            ColumnBuilder::Float(v) => v.push(None),
            ColumnBuilder::Bool(v) => v.push(None),
            ColumnBuilder::Date(v) => v.push(None),
            ColumnBuilder::DateTime(v) => v.push(None),
            ColumnBuilder::Utf8(v) => v.push(None),
            ColumnBuilder::Enum(b) => b.append_null(),
            ColumnBuilder::Binary(v) => v.push(None),
        }
    }

    /// Build the array, narrowing to `dt`. Also returns the number of values
    /// lost to narrowing (out of range for the target type).
    fn finish(self, dt: &DataType) -> crate::Result<(ArrayRef, usize)> {
        let wide: ArrayRef = match self {
            ColumnBuilder::Int(v) => Arc::new(Int64Array::from(v)),
            ColumnBuilder::Float(v) => Arc::new(Float64Array::from(v)),
            ColumnBuilder::Bool(v) => Arc::new(BooleanArray::from(v)),
            ColumnBuilder::Date(v) => Arc::new(Date32Array::from(v)),
            ColumnBuilder::DateTime(v) => Arc::new(TimestampMicrosecondArray::from(v)),
            ColumnBuilder::Utf8(v) => Arc::new(StringArray::from(v)),
            ColumnBuilder::Enum(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(v) => {
                Arc::new(BinaryArray::from_iter(v.iter().map(|b| b.as_deref())))
            }
        };
        if wide.data_type() == dt {
            return Ok((wide, 0));
        }
        let narrow = arrow::compute::cast(&wide, dt)?;
        let lost = narrow.null_count().saturating_sub(wide.null_count());
        Ok((narrow, lost))
    }
}

fn push_opt<T>(v: &mut Vec<Option<T>>, value: Option<T>) -> bool {
    let ok = value.is_some();
    v.push(value);
    ok
}

fn to_i64(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Integer(i) => Some(*i),
        SqlValue::Real(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Integer(i) => Some(*i as f64),
        SqlValue::Real(f) => Some(*f),
        SqlValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_bool(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Integer(i) => Some(*i != 0),
        SqlValue::Real(f) => Some(*f != 0.0),
        SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Some(true),
            "0" | "false" | "f" | "no" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_date32(value: &SqlValue) -> Option<i32> {
    let SqlValue::Text(s) = value else {
        return None;
    };
    let date = parse_date(s).or_else(|| parse_datetime(s).map(|dt| dt.date()))?;
    Some(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
}

/// Text is parsed as a datetime literal; integers are epoch seconds.
fn to_timestamp_us(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Text(s) => parse_datetime(s).map(|dt| dt.and_utc().timestamp_micros()),
        SqlValue::Integer(secs) => DateTime::from_timestamp(*secs, 0).map(|dt| dt.timestamp_micros()),
        _ => None,
    }
}

fn to_text(value: SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s,
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => f.to_string(),
        SqlValue::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
        SqlValue::Null => String::new(),
    }
}

fn to_bytes(value: SqlValue) -> Option<Vec<u8>> {
    match value {
        SqlValue::Blob(b) => Some(b),
        SqlValue::Text(s) => Some(s.into_bytes()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use arrow::datatypes::Date32Type;
    use rusqlite::Connection;

    use super::*;
    use crate::inspector::SqliteSource;
    use crate::inspector::tests::fixture_db;

    #[test]
    fn test_download_types_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();
        let db = Database::download(&src, false).unwrap();

        assert_eq!(
            db.table_names().collect::<Vec<_>>(),
            ["customers", "orders", "shipments", "tracking"]
        );
        let customers = db.get("customers").unwrap();
        assert_eq!(customers.num_rows(), 2);
        assert_eq!(customers.pkey_col.as_deref(), Some("id"));
        assert_eq!(customers.column("id").unwrap().data_type(), &DataType::Int64);
        assert_eq!(customers.column("name").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(
            customers.row_ids().unwrap().collect::<Vec<_>>(),
            [RowIdx(0), RowIdx(1)]
        );

        let orders = db.get("orders").unwrap();
        let amount = orders.column("amount").unwrap();
        assert_eq!(amount.data_type(), &DataType::Float64);
        assert!(amount.is_null(2));
        assert_eq!(
            orders.fkey_col_to_pkey_table.get("customer_id").map(String::as_str),
            Some("customers")
        );

        // Composite keys are not recorded.
        assert_eq!(db.get("shipments").unwrap().pkey_col, None);
        let tracking = db.get("tracking").unwrap();
        assert_eq!(tracking.fkey_col_to_pkey_table.len(), 1);
        assert!(tracking.fkey_col_to_pkey_table.contains_key("customer"));
        assert_eq!(tracking.num_rows(), 0);
    }

    #[test]
    fn test_unconvertible_values_become_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE m (n INTEGER, d DATE, e ENUM, t TIME, b BOOLEAN, s TINYINT);
            INSERT INTO m VALUES (1, '2020-01-02', 'a', '10:00:00', 1, 5);
            INSERT INTO m VALUES ('x', 'bad', 'b', NULL, 'false', 300);
            "#,
        )
        .unwrap();
        drop(conn);

        let src = SqliteSource::open_path(&path).unwrap();
        let db = Database::download(&src, false).unwrap();
        let m = db.get("m").unwrap();

        let n = m.column("n").unwrap().as_primitive::<arrow::datatypes::Int64Type>();
        assert_eq!(n.iter().collect::<Vec<_>>(), [Some(1), None]);

        let d = m.column("d").unwrap().as_primitive::<Date32Type>();
        assert_eq!(d.iter().collect::<Vec<_>>(), [Some(18263), None]);

        assert!(matches!(
            m.column("e").unwrap().data_type(),
            DataType::Dictionary(_, _)
        ));
        assert_eq!(m.column("t").unwrap().data_type(), &DataType::Utf8);

        let b = m.column("b").unwrap().as_boolean();
        assert_eq!(b.iter().collect::<Vec<_>>(), [Some(true), Some(false)]);

        // 300 does not fit in an Int8.
        let s = m.column("s").unwrap().as_primitive::<arrow::datatypes::Int8Type>();
        assert_eq!(s.iter().collect::<Vec<_>>(), [Some(5), None]);
    }

    #[test]
    fn test_parquet_round_trip_keeps_key_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let src = SqliteSource::open_path(&fixture_db(dir.path())).unwrap();
        let db = Database::download(&src, false).unwrap();

        let cache = dir.path().join("db");
        db.save(&cache).unwrap();
        let loaded = Database::load(&cache, db.table_names()).unwrap();
        assert_eq!(loaded, db);
    }

    #[test]
    fn test_load_missing_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Database::load(dir.path(), ["nope"]).is_err());
    }
}
