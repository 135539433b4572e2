//! Builds a [`HeteroGraph`] from a materialized [`Database`] and its [`Schema`].
//!
//! Every foreign key becomes an edge type whose edges come from an inner
//! equi-join of the key columns. Every table becomes a node type whose
//! features are the concatenated encodings of its columns. Problems with a
//! single edge type or column are logged, recorded in the [`BuildReport`],
//! and skipped; the rest of the graph is still built.

use std::collections::HashMap;
use std::fmt;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{DataType, Float32Type};
use arrow::error::ArrowError;
use arrow::row::{RowConverter, SortField};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::common::{ColumnStats, RowIdx, Stype, progress_bar};
use crate::config::{BuilderConfig, CategoricalEncoding, ConfigError, TargetRef};
use crate::convert::{
    CategoricalConverter, ConvertError, IdentityConverter, SeriesConverter, converter_for,
    numeric_values, timestamp_values,
};
use crate::database::{Database, Table};
use crate::embedder::TextEmbedder;
use crate::graph::{EdgeIndex, EdgeType, FeatureColumn, FeatureMatrix, HeteroGraph, Label, NodeStore};
use crate::schema::{ColumnDef, ForeignKeyDef, Schema, SchemaError, TableSchema};
use crate::stats::compute_stats;
use crate::stype::infer_stype;

// ============================================================================
// Edge joins
// ============================================================================

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("table {0} does not exist")]
    MissingTable(String),

    #[error("column {table}.{column} does not exist")]
    MissingColumn { table: String, column: String },

    #[error("cannot join {column} ({left}) with {ref_column} ({right})")]
    TypeMismatch {
        column: String,
        ref_column: String,
        left: DataType,
        right: DataType,
    },

    #[error("foreign key pairs {0} columns with {1}")]
    Arity(usize, usize),

    #[error("table {table} has {rows} rows, more than a row id can address")]
    TooManyRows { table: String, rows: usize },

    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

/// The type both sides of a key pair are cast to before joining.
fn join_type(left: &DataType, right: &DataType) -> Option<DataType> {
    let is_string = |dt: &DataType| match dt {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => true,
        DataType::Dictionary(_, value) => {
            matches!(value.as_ref(), DataType::Utf8 | DataType::LargeUtf8)
        }
        _ => false,
    };
    let is_number = |dt: &DataType| dt.is_integer() || dt.is_floating();
    if left.is_integer() && right.is_integer() {
        Some(DataType::Int64)
    } else if is_number(left) && is_number(right) {
        Some(DataType::Float64)
    } else if is_string(left) && is_string(right) {
        Some(DataType::Utf8)
    } else if left == right {
        Some(left.clone())
    } else {
        None
    }
}

fn row_ids(table: &Table, table_name: &str) -> Result<impl Iterator<Item = RowIdx> + use<>, JoinError> {
    table.row_ids().ok_or_else(|| JoinError::TooManyRows {
        table: table_name.to_string(),
        rows: table.num_rows(),
    })
}

fn key_columns(table: &Table, table_name: &str, columns: &[String]) -> Result<Vec<ArrayRef>, JoinError> {
    columns
        .iter()
        .map(|c| {
            table.column(c).cloned().ok_or_else(|| JoinError::MissingColumn {
                table: table_name.to_string(),
                column: c.clone(),
            })
        })
        .collect()
}

/// Inner equi-join of `fk.columns` in `table` against `fk.ref_columns` in
/// `ref_table`, as pairs of [`RowIdx`].
///
/// Edges are ordered by referencing row, then by referenced row. Rows with a
/// null in any key column never match.
pub fn fk_to_edge_index(
    fk: &ForeignKeyDef,
    table: &Table,
    ref_table: &Table,
) -> Result<EdgeIndex, JoinError> {
    if fk.columns.len() != fk.ref_columns.len() {
        return Err(JoinError::Arity(fk.columns.len(), fk.ref_columns.len()));
    }
    let left = key_columns(table, &fk.table, &fk.columns)?;
    let right = key_columns(ref_table, &fk.ref_table, &fk.ref_columns)?;

    let mut fields = Vec::with_capacity(left.len());
    let mut left_cast = Vec::with_capacity(left.len());
    let mut right_cast = Vec::with_capacity(right.len());
    for (i, (l, r)) in left.iter().zip(&right).enumerate() {
        let dt = join_type(l.data_type(), r.data_type()).ok_or_else(|| JoinError::TypeMismatch {
            column: fk.columns[i].clone(),
            ref_column: fk.ref_columns[i].clone(),
            left: l.data_type().clone(),
            right: r.data_type().clone(),
        })?;
        left_cast.push(arrow::compute::cast(l, &dt)?);
        right_cast.push(arrow::compute::cast(r, &dt)?);
        fields.push(SortField::new(dt));
    }

    let converter = RowConverter::new(fields)?;
    let left_rows = converter.convert_columns(&left_cast)?;
    let right_rows = converter.convert_columns(&right_cast)?;
    let has_null = |cols: &[ArrayRef], i: usize| cols.iter().any(|c| c.is_null(i));

    let mut lookup: HashMap<_, Vec<RowIdx>> = HashMap::new();
    for (j, ref_id) in row_ids(ref_table, &fk.ref_table)?.enumerate() {
        if !has_null(&right_cast, j) {
            lookup.entry(right_rows.row(j)).or_default().push(ref_id);
        }
    }

    let mut edges = EdgeIndex::default();
    for (i, id) in row_ids(table, &fk.table)?.enumerate() {
        if has_null(&left_cast, i) {
            continue;
        }
        if let Some(matches) = lookup.get(&left_rows.row(i)) {
            for &ref_id in matches {
                edges.push(id, ref_id);
            }
        }
    }
    Ok(edges)
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEdge {
    pub edge_type: EdgeType,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedColumn {
    pub table: String,
    pub column: String,
    pub reason: String,
}

/// Everything the builder had to leave out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildReport {
    pub skipped_edges: Vec<SkippedEdge>,
    pub dropped_columns: Vec<DroppedColumn>,
}

impl BuildReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_edges.is_empty() && self.dropped_columns.is_empty()
    }

    fn skip_edge(&mut self, edge_type: &EdgeType, reason: impl fmt::Display) {
        warn!("Failed to join on foreign key {edge_type}. Reason: {reason}");
        self.skipped_edges.push(SkippedEdge {
            edge_type: edge_type.clone(),
            reason: reason.to_string(),
        });
    }

    fn drop_column(&mut self, table: &str, column: &str, reason: impl fmt::Display) {
        warn!("Dropping column {table}.{column}: {reason}");
        self.dropped_columns.push(DroppedColumn {
            table: table.to_string(),
            column: column.to_string(),
            reason: reason.to_string(),
        });
    }
}

impl fmt::Display for BuildReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} skipped edge types, {} dropped columns",
            self.skipped_edges.len(),
            self.dropped_columns.len()
        )?;
        for e in &self.skipped_edges {
            writeln!(f, "  edge {}: {}", e.edge_type, e.reason)?;
        }
        for c in &self.dropped_columns {
            writeln!(f, "  column {}.{}: {}", c.table, c.column, c.reason)?;
        }
        Ok(())
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct GraphBuilder<'a> {
    schema: &'a Schema,
    db: &'a Database,
    config: &'a BuilderConfig,
    embedder: &'a dyn TextEmbedder,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(
        schema: &'a Schema,
        db: &'a Database,
        config: &'a BuilderConfig,
        embedder: &'a dyn TextEmbedder,
    ) -> Self {
        Self {
            schema,
            db,
            config,
            embedder,
        }
    }

    pub fn build(&self) -> crate::Result<(HeteroGraph, BuildReport)> {
        self.check_target()?;
        let missing: Vec<String> = self
            .schema
            .table_names()
            .filter(|t| self.db.get(t).is_none())
            .map(|t| format!("table {t} has no data"))
            .collect();
        if !missing.is_empty() {
            return Err(SchemaError::Inconsistent(missing).into());
        }

        let mut report = BuildReport::default();
        let mut graph = HeteroGraph::default();

        let pb = progress_bar(
            self.schema.len() as u64,
            "  Building   {bar:40.cyan/blue} {pos}/{len} tables [{elapsed_precise}] {msg}",
            self.config.progress,
        );
        for (name, table_schema) in self.schema.iter() {
            pb.set_message(name.clone());
            for fk in &table_schema.foreign_keys {
                let edge_type = EdgeType::new(name.clone(), fk.descriptor(), fk.ref_table.clone());
                match self.build_edges(name, fk) {
                    Ok(index) => {
                        graph.edges.insert(edge_type, index);
                    }
                    Err(e) => report.skip_edge(&edge_type, e),
                }
            }

            let store = self.build_node(name, table_schema, &mut report)?;
            info!(
                "  {name}: {} rows, {} features from {} columns",
                store.num_rows(),
                store.num_features(),
                store.columns.len()
            );
            graph.nodes.insert(name.clone(), store);
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok((graph, report))
    }

    /// Target table and column must exist in both the schema and the data.
    fn check_target(&self) -> Result<(), ConfigError> {
        let Some(target) = &self.config.target else {
            return Ok(());
        };
        let exists = self
            .schema
            .get(&target.table)
            .is_some_and(|t| t.columns.contains_key(&target.column))
            && self
                .db
                .get(&target.table)
                .is_some_and(|t| t.column(&target.column).is_some());
        if !exists {
            return Err(ConfigError::TargetNotFound(target.clone()));
        }
        Ok(())
    }

    fn build_edges(&self, table: &str, fk: &ForeignKeyDef) -> Result<EdgeIndex, JoinError> {
        let src = self
            .db
            .get(table)
            .ok_or_else(|| JoinError::MissingTable(table.to_string()))?;
        let dst = self
            .db
            .get(&fk.ref_table)
            .ok_or_else(|| JoinError::MissingTable(fk.ref_table.clone()))?;
        fk_to_edge_index(fk, src, dst)
    }

    /// Statistical type of a column: the kind's type, else inferred from data.
    fn resolve_stype(&self, def: &ColumnDef, column: &ArrayRef) -> Option<Stype> {
        def.stype()
            .or_else(|| infer_stype(column.as_ref(), &self.config.categorical))
    }

    fn build_node(
        &self,
        name: &str,
        table_schema: &TableSchema,
        report: &mut BuildReport,
    ) -> crate::Result<NodeStore> {
        let table = self
            .db
            .get(name)
            .ok_or_else(|| SchemaError::Inconsistent(vec![format!("table {name} has no data")]))?;
        let num_rows = table.num_rows();
        let target = self.config.target.as_ref().filter(|t| t.table == name);

        let mut columns = Vec::new();
        let mut col_stats = IndexMap::new();
        let mut series: Vec<Vec<f32>> = Vec::new();

        for (col_name, def) in &table_schema.columns {
            if target.is_some_and(|t| &t.column == col_name) {
                continue;
            }
            let Some(array) = table.column(col_name) else {
                report.drop_column(name, col_name, "column has no data");
                continue;
            };
            let Some(stype) = self.resolve_stype(def, array) else {
                report.drop_column(name, col_name, "cannot infer a statistical type");
                continue;
            };

            match self.encode_column(def, stype, array) {
                Ok((stats, outputs)) => {
                    debug!(
                        "    {name}.{col_name}: {stype}, {} nulls, {} features",
                        stats.num_nulls(),
                        outputs.len()
                    );
                    columns.push(FeatureColumn {
                        name: col_name.clone(),
                        stype,
                        offset: series.len() as u32,
                        width: outputs.len() as u32,
                    });
                    col_stats.insert(col_name.clone(), stats);
                    series.extend(outputs);
                }
                Err(e) => report.drop_column(name, col_name, e),
            }
        }

        let mut features = FeatureMatrix::zeros(num_rows, series.len());
        for (j, values) in series.iter().enumerate() {
            for (i, &v) in values.iter().enumerate() {
                features.set(i, j, v);
            }
        }

        let label = match target {
            Some(t) => Some(self.build_label(t, table_schema, table)?),
            None => None,
        };

        Ok(NodeStore {
            features,
            columns,
            col_stats,
            label,
        })
    }

    /// Statistics and `f32` output series of one column.
    fn encode_column(
        &self,
        def: &ColumnDef,
        stype: Stype,
        array: &ArrayRef,
    ) -> Result<(ColumnStats, Vec<Vec<f32>>), ConvertError> {
        let stats = compute_stats(stype, array.as_ref(), max_categories(def), self.embedder.dim())?;
        if stype == Stype::TextEmbedded {
            info!(
                "    Embedding {} strings",
                indicatif::HumanCount(array.len() as u64)
            );
        }
        let converter = converter_for(stype, self.config, self.embedder);
        let outputs = converter
            .convert(def, &stats, array)?
            .iter()
            .map(|a| to_f32(a, 0.0))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((stats, outputs))
    }

    fn build_label(
        &self,
        target: &TargetRef,
        table_schema: &TableSchema,
        table: &Table,
    ) -> crate::Result<Label> {
        let missing = || ConfigError::TargetNotFound(target.clone());
        let def = table_schema.columns.get(&target.column).ok_or_else(missing)?;
        let array = table.column(&target.column).ok_or_else(missing)?;
        let stype = self.resolve_stype(def, array).ok_or_else(missing)?;
        let convert_err = |e: ConvertError| crate::Error::Convert {
            table: target.table.clone(),
            column: target.column.clone(),
            reason: e.to_string(),
        };

        let stats = compute_stats(stype, array.as_ref(), max_categories(def), 0).map_err(convert_err)?;
        let values = match stype {
            Stype::Categorical => {
                let converter = CategoricalConverter {
                    encoding: CategoricalEncoding::Code,
                };
                let codes = converter.convert(def, &stats, array).map_err(convert_err)?;
                to_f32(&codes[0], -1.0).map_err(convert_err)?
            }
            Stype::Numerical => {
                let raw = IdentityConverter.convert(def, &stats, array).map_err(convert_err)?;
                numeric_values(raw[0].as_ref())
                    .map_err(convert_err)?
                    .into_iter()
                    .map(|v| v.map_or(f32::NAN, |v| v as f32))
                    .collect()
            }
            Stype::Timestamp => {
                let &ColumnStats::Timestamp { mean_us, std_us, .. } = &stats else {
                    return Err(convert_err(ConvertError::StatsMismatch {
                        expected: stype,
                        stats: stats.stype(),
                    }));
                };
                let std_us = if std_us > 0.0 { std_us } else { 1.0 };
                timestamp_values(array.as_ref())
                    .map_err(convert_err)?
                    .into_iter()
                    .map(|v| v.map_or(f32::NAN, |us| ((us as f64 - mean_us) / std_us) as f32))
                    .collect()
            }
            Stype::TextEmbedded => {
                return Err(ConfigError::UnsupportedTarget {
                    target: target.clone(),
                    stype,
                }
                .into());
            }
        };

        Ok(Label {
            column: target.column.clone(),
            stype,
            stats,
            values,
        })
    }
}

/// Vocabulary bound recorded in the schema, if any.
fn max_categories(def: &ColumnDef) -> Option<usize> {
    match def {
        ColumnDef::Categorical { cardinality } if *cardinality > 0 => Some(*cardinality as usize),
        _ => None,
    }
}

/// Cast a converter output to `f32`, replacing nulls with `null_value`.
fn to_f32(array: &ArrayRef, null_value: f32) -> Result<Vec<f32>, ConvertError> {
    let cast = arrow::compute::cast(array, &DataType::Float32)?;
    Ok(cast
        .as_primitive::<Float32Type>()
        .iter()
        .map(|v| v.unwrap_or(null_value))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{DictionaryArray, Float64Array, Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Int32Type, Schema as ArrowSchema};
    use arrow::record_batch::RecordBatch;

    use super::*;
    use crate::embedder::ZeroEmbedder;

    fn table(columns: Vec<(&str, ArrayRef)>) -> Table {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(n, a)| Field::new(*n, a.data_type().clone(), true))
            .collect();
        let arrays = columns.into_iter().map(|(_, a)| a).collect();
        let batch = RecordBatch::try_new(Arc::new(ArrowSchema::new(fields)), arrays).unwrap();
        Table::new(batch, None, IndexMap::new())
    }

    fn fk(table: &str, cols: &[&str], ref_table: &str, ref_cols: &[&str]) -> ForeignKeyDef {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        ForeignKeyDef::new(table, owned(cols), ref_table, owned(ref_cols)).unwrap()
    }

    fn ints(v: Vec<Option<i64>>) -> ArrayRef {
        Arc::new(Int64Array::from(v))
    }

    #[test]
    fn test_join_matches_inner_join_and_keys() {
        let orders = table(vec![(
            "customer_id",
            ints(vec![Some(1), Some(2), Some(1), Some(3), None]),
        )]);
        let customers = table(vec![("id", ints(vec![Some(2), Some(1)]))]);
        let fk = fk("orders", &["customer_id"], "customers", &["id"]);

        let index = fk_to_edge_index(&fk, &orders, &customers).unwrap();
        assert_eq!(index.pairs().collect::<Vec<_>>(), [(0, 1), (1, 0), (2, 1)]);

        // Key equality along every edge.
        let l = orders.column("customer_id").unwrap().as_primitive::<arrow::datatypes::Int64Type>();
        let r = customers.column("id").unwrap().as_primitive::<arrow::datatypes::Int64Type>();
        for (s, d) in index.pairs() {
            assert_eq!(l.value(s as usize), r.value(d as usize));
        }
    }

    #[test]
    fn test_join_order_with_duplicate_referenced_keys() {
        let left = table(vec![("k", ints(vec![Some(7), Some(8), Some(7)]))]);
        let right = table(vec![("k", ints(vec![Some(7), Some(9), Some(7)]))]);
        let fk = fk("l", &["k"], "r", &["k"]);
        let index = fk_to_edge_index(&fk, &left, &right).unwrap();
        assert_eq!(
            index.pairs().collect::<Vec<_>>(),
            [(0, 0), (0, 2), (2, 0), (2, 2)]
        );
    }

    #[test]
    fn test_join_casts_compatible_key_types() {
        let left = table(vec![("k", Arc::new(Int32Array::from(vec![1, 2])) as ArrayRef)]);
        let right = table(vec![("k", ints(vec![Some(2)]))]);
        let index = fk_to_edge_index(&fk("l", &["k"], "r", &["k"]), &left, &right).unwrap();
        assert_eq!(index.pairs().collect::<Vec<_>>(), [(1, 0)]);

        let dict: DictionaryArray<Int32Type> = vec!["a", "b"].into_iter().collect();
        let left = table(vec![("k", Arc::new(dict) as ArrayRef)]);
        let right = table(vec![("k", Arc::new(StringArray::from(vec!["b", "a"])) as ArrayRef)]);
        let index = fk_to_edge_index(&fk("l", &["k"], "r", &["k"]), &left, &right).unwrap();
        assert_eq!(index.pairs().collect::<Vec<_>>(), [(0, 1), (1, 0)]);
    }

    #[test]
    fn test_join_integer_against_float_keys() {
        let left = table(vec![(
            "k",
            Arc::new(Float64Array::from(vec![Some(2.0), Some(2.5), None, Some(1.0)])) as ArrayRef,
        )]);
        let right = table(vec![("k", ints(vec![Some(1), Some(2)]))]);
        let index = fk_to_edge_index(&fk("l", &["k"], "r", &["k"]), &left, &right).unwrap();
        assert_eq!(index.pairs().collect::<Vec<_>>(), [(0, 1), (3, 0)]);
    }

    #[test]
    fn test_join_endpoints_are_row_ids() {
        let orders = table(vec![("customer_id", ints(vec![Some(2), None, Some(1), Some(2)]))]);
        let customers = table(vec![("id", ints(vec![Some(1), Some(2)]))]);
        let index =
            fk_to_edge_index(&fk("orders", &["customer_id"], "customers", &["id"]), &orders, &customers)
                .unwrap();

        let order_ids: Vec<RowIdx> = orders.row_ids().unwrap().collect();
        let customer_ids: Vec<RowIdx> = customers.row_ids().unwrap().collect();
        let expected = EdgeIndex::from_pairs(
            [(order_ids[0], customer_ids[1]), (order_ids[2], customer_ids[0]), (order_ids[3], customer_ids[1])]
                .map(|(s, d)| (s.0, d.0)),
        );
        assert_eq!(index, expected);
    }

    #[test]
    fn test_join_multi_column_keys() {
        let left = table(vec![
            ("a", ints(vec![Some(1), Some(1), Some(2)])),
            (
                "b",
                Arc::new(StringArray::from(vec![Some("x"), Some("y"), None])) as ArrayRef,
            ),
        ]);
        let right = table(vec![
            ("a", ints(vec![Some(1), Some(2), Some(1)])),
            (
                "b",
                Arc::new(StringArray::from(vec![Some("y"), None, Some("x")])) as ArrayRef,
            ),
        ]);
        let index =
            fk_to_edge_index(&fk("l", &["a", "b"], "r", &["a", "b"]), &left, &right).unwrap();
        // (2, NULL) never matches, even against (2, NULL).
        assert_eq!(index.pairs().collect::<Vec<_>>(), [(0, 2), (1, 0)]);
    }

    #[test]
    fn test_join_errors() {
        let left = table(vec![("k", Arc::new(StringArray::from(vec!["1"])) as ArrayRef)]);
        let right = table(vec![("k", ints(vec![Some(1)]))]);
        assert!(matches!(
            fk_to_edge_index(&fk("l", &["k"], "r", &["k"]), &left, &right),
            Err(JoinError::TypeMismatch { .. })
        ));
        assert!(matches!(
            fk_to_edge_index(&fk("l", &["nope"], "r", &["k"]), &left, &right),
            Err(JoinError::MissingColumn { .. })
        ));
    }

    fn shop() -> (Schema, Database) {
        let customers = table(vec![
            ("id", ints(vec![Some(1), Some(2), Some(3)])),
            (
                "tier",
                Arc::new(StringArray::from(vec![Some("gold"), Some("gold"), None])) as ArrayRef,
            ),
        ]);
        let orders = table(vec![
            ("id", ints(vec![Some(10), Some(11), Some(12), Some(13)])),
            ("customer_id", ints(vec![Some(1), Some(9), Some(3), Some(1)])),
            (
                "amount",
                Arc::new(Float64Array::from(vec![Some(1.0), Some(3.0), None, Some(2.0)])) as ArrayRef,
            ),
            (
                "code",
                Arc::new(StringArray::from(vec!["a", "a", "b", "a"])) as ArrayRef,
            ),
            (
                "blob",
                Arc::new(arrow::array::BinaryArray::from(vec![&b"x"[..]; 4])) as ArrayRef,
            ),
        ]);
        let db: Database = [
            ("customers".to_string(), customers),
            ("orders".to_string(), orders),
        ]
        .into_iter()
        .collect();

        let schema: Schema = [
            (
                "customers".to_string(),
                TableSchema {
                    columns: IndexMap::from([
                        ("id".to_string(), ColumnDef::Omit),
                        ("tier".to_string(), ColumnDef::Categorical { cardinality: 1 }),
                    ]),
                    foreign_keys: vec![],
                },
            ),
            (
                "orders".to_string(),
                TableSchema {
                    columns: IndexMap::from([
                        ("id".to_string(), ColumnDef::Omit),
                        ("customer_id".to_string(), ColumnDef::Omit),
                        ("amount".to_string(), ColumnDef::Numeric),
                        ("code".to_string(), ColumnDef::Categorical { cardinality: 2 }),
                        ("blob".to_string(), ColumnDef::Omit),
                    ]),
                    foreign_keys: vec![fk("orders", &["customer_id"], "customers", &["id"])],
                },
            ),
        ]
        .into_iter()
        .collect();
        (schema, db)
    }

    #[test]
    fn test_build_nodes_and_edges() {
        let (schema, db) = shop();
        let config = BuilderConfig::default();
        let embedder = ZeroEmbedder { dim: 4 };
        let (graph, report) = GraphBuilder::new(&schema, &db, &config, &embedder)
            .build()
            .unwrap();

        let et = EdgeType::new("orders", "customer_id", "customers");
        assert_eq!(
            graph.edge(&et).unwrap().pairs().collect::<Vec<_>>(),
            [(0, 0), (2, 2), (3, 0)]
        );

        let orders = graph.node("orders").unwrap();
        assert_eq!(orders.num_rows(), 4);
        // id and customer_id fall back to inference; blob has no statistical type.
        let names: Vec<&str> = orders.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["id", "customer_id", "amount", "code"]);
        assert_eq!(report.dropped_columns.len(), 1);
        assert_eq!(report.dropped_columns[0].column, "blob");

        // amount: mean 2, std 1, null filled with the mean.
        let amount: Vec<f32> = (0..4)
            .map(|i| orders.column_slice(i, "amount").unwrap()[0])
            .collect();
        assert_eq!(amount, [-1.0, 1.0, 0.0, 0.0]);

        // code: "a" is most frequent.
        let code: Vec<f32> = (0..4)
            .map(|i| orders.column_slice(i, "code").unwrap()[0])
            .collect();
        assert_eq!(code, [0.0, 0.0, 1.0, 0.0]);

        // Vocabulary truncated to the recorded cardinality; null is -1.
        let customers = graph.node("customers").unwrap();
        let tier: Vec<f32> = (0..3)
            .map(|i| customers.column_slice(i, "tier").unwrap()[0])
            .collect();
        assert_eq!(tier, [0.0, 0.0, -1.0]);
    }

    #[test]
    fn test_skipped_edge_does_not_abort() {
        let (mut schema_src, db) = shop();
        let mut tables: IndexMap<String, TableSchema> =
            schema_src.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        tables["orders"]
            .foreign_keys
            .push(fk("orders", &["code"], "customers", &["id"]));
        schema_src = Schema::new(tables);

        let config = BuilderConfig::default();
        let embedder = ZeroEmbedder { dim: 4 };
        let (graph, report) = GraphBuilder::new(&schema_src, &db, &config, &embedder)
            .build()
            .unwrap();
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(report.skipped_edges.len(), 1);
        assert_eq!(
            report.skipped_edges[0].edge_type,
            EdgeType::new("orders", "code", "customers")
        );
    }

    #[test]
    fn test_feature_columns_are_order_independent() {
        let (schema, db) = shop();
        let reversed: Schema = schema
            .iter()
            .map(|(name, ts)| {
                let mut ts = ts.clone();
                ts.columns.reverse();
                (name.clone(), ts)
            })
            .collect();
        let config = BuilderConfig::default();
        let embedder = ZeroEmbedder { dim: 4 };
        let (a, _) = GraphBuilder::new(&schema, &db, &config, &embedder).build().unwrap();
        let (b, _) = GraphBuilder::new(&reversed, &db, &config, &embedder).build().unwrap();

        let (na, nb) = (a.node("orders").unwrap(), b.node("orders").unwrap());
        assert_eq!(na.num_features(), nb.num_features());
        for col in ["id", "amount", "code"] {
            for row in 0..na.num_rows() {
                assert_eq!(na.column_slice(row, col), nb.column_slice(row, col));
            }
        }
    }

    #[test]
    fn test_label_is_excluded_from_features() {
        let (schema, db) = shop();
        let config = BuilderConfig {
            target: Some(TargetRef::parse("orders.code").unwrap()),
            categorical_encoding: CategoricalEncoding::OneHot,
            ..Default::default()
        };
        let embedder = ZeroEmbedder { dim: 4 };
        let (graph, _) = GraphBuilder::new(&schema, &db, &config, &embedder).build().unwrap();
        let orders = graph.node("orders").unwrap();
        assert!(orders.feature_column("code").is_none());
        let label = orders.label.as_ref().unwrap();
        assert_eq!(label.stype, Stype::Categorical);
        assert_eq!(label.values, [0.0, 0.0, 1.0, 0.0]);
        assert!(graph.node("customers").unwrap().label.is_none());

        // One-hot widens categorical features.
        let tier = graph.node("customers").unwrap().feature_column("tier").unwrap();
        assert_eq!(tier.width, 1);
    }

    #[test]
    fn test_numeric_label_keeps_raw_values() {
        let (schema, db) = shop();
        let config = BuilderConfig {
            target: Some(TargetRef::parse("orders.amount").unwrap()),
            ..Default::default()
        };
        let embedder = ZeroEmbedder { dim: 4 };
        let (graph, _) = GraphBuilder::new(&schema, &db, &config, &embedder).build().unwrap();
        let label = graph.node("orders").unwrap().label.as_ref().unwrap();
        assert_eq!(label.values[..2], [1.0, 3.0]);
        assert!(label.values[2].is_nan());
    }

    #[test]
    fn test_timestamp_label_keeps_minute_resolution() {
        let events = table(vec![(
            "at",
            Arc::new(StringArray::from(vec![
                Some("2024-06-01 12:00:00"),
                Some("2024-06-01 12:01:00"),
                None,
                Some("2024-06-01 12:02:00"),
            ])) as ArrayRef,
        )]);
        let db: Database = [("events".to_string(), events)].into_iter().collect();
        let schema: Schema = [(
            "events".to_string(),
            TableSchema {
                columns: IndexMap::from([("at".to_string(), ColumnDef::DateTime)]),
                foreign_keys: vec![],
            },
        )]
        .into_iter()
        .collect();
        let config = BuilderConfig {
            target: Some(TargetRef::parse("events.at").unwrap()),
            ..Default::default()
        };
        let embedder = ZeroEmbedder { dim: 4 };
        let (graph, _) = GraphBuilder::new(&schema, &db, &config, &embedder).build().unwrap();

        let label = graph.node("events").unwrap().label.as_ref().unwrap();
        assert_eq!(label.stype, Stype::Timestamp);
        assert!((label.values[0] + 1.0).abs() < 1e-5);
        assert!(label.values[1].abs() < 1e-5);
        assert!(label.values[2].is_nan());
        assert!((label.values[3] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_target_fails_fast() {
        let (schema, db) = shop();
        let config = BuilderConfig {
            target: Some(TargetRef::parse("orders.nope").unwrap()),
            ..Default::default()
        };
        let embedder = ZeroEmbedder { dim: 4 };
        let err = GraphBuilder::new(&schema, &db, &config, &embedder)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::TargetNotFound(_))
        ));
    }
}
