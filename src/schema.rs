//! Typed description of a relational database: tables, column kinds and
//! foreign keys.
//!
//! A [`Schema`] is produced once by the [`SchemaAnalyzer`](crate::analyzer::SchemaAnalyzer)
//! (or reloaded from `schema.json`) and is read-only afterwards. The serialized
//! form is a nested mapping:
//!
//! ```text
//! {
//!   "orders": {
//!     "columns": { "id": {"kind": "omit"}, "status": {"kind": "categorical", "cardinality": 3} },
//!     "foreign_keys": [
//!       {"table": "orders", "columns": ["customer_id"], "ref_table": "customers", "ref_columns": ["id"]}
//!     ]
//!   },
//!   ...
//! }
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::Stype;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(
        "foreign key {table}({}) -> {ref_table}({}) pairs {} columns with {}",
        columns.join(", "),
        ref_columns.join(", "),
        columns.len(),
        ref_columns.len()
    )]
    ForeignKeyArity {
        table: String,
        columns: Vec<String>,
        ref_table: String,
        ref_columns: Vec<String>,
    },

    #[error("foreign key on {0} has no columns")]
    EmptyForeignKey(String),

    #[error("schema is inconsistent: {}", .0.join("; "))]
    Inconsistent(Vec<String>),
}

// ============================================================================
// Column kinds
// ============================================================================

/// Semantic kind of a column, with kind-specific metadata.
///
/// The set of kinds is closed; every consumer dispatches with a `match`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnDef {
    /// Low-cardinality codes. `cardinality` is the number of distinct values
    /// observed when the schema was inferred.
    Categorical { cardinality: u32 },
    Date,
    DateTime,
    Numeric,
    /// Time-of-day or interval values, modelled as a number of seconds.
    Duration,
    Text,
    /// No usable kind. The graph builder infers a statistical type from the
    /// data instead.
    Omit,
}

impl ColumnDef {
    /// The statistical type this kind is modelled as, or `None` when the
    /// column's statistical type must be inferred from the data.
    pub fn stype(&self) -> Option<Stype> {
        match self {
            ColumnDef::Categorical { .. } => Some(Stype::Categorical),
            ColumnDef::Date | ColumnDef::DateTime => Some(Stype::Timestamp),
            ColumnDef::Numeric | ColumnDef::Duration => Some(Stype::Numerical),
            ColumnDef::Text => Some(Stype::TextEmbedded),
            ColumnDef::Omit => None,
        }
    }

    /// Short human-readable name of the kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ColumnDef::Categorical { .. } => "categorical",
            ColumnDef::Date => "date",
            ColumnDef::DateTime => "datetime",
            ColumnDef::Numeric => "numeric",
            ColumnDef::Duration => "duration",
            ColumnDef::Text => "text",
            ColumnDef::Omit => "omit",
        }
    }
}

// ============================================================================
// Foreign keys
// ============================================================================

/// An equi-join relationship: `table(columns) -> ref_table(ref_columns)`.
///
/// Columns are positionally paired; the constructor (and deserialization)
/// reject lists of different lengths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawForeignKeyDef")]
pub struct ForeignKeyDef {
    pub table: String,
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

#[derive(Deserialize)]
struct RawForeignKeyDef {
    table: String,
    columns: Vec<String>,
    ref_table: String,
    ref_columns: Vec<String>,
}

impl TryFrom<RawForeignKeyDef> for ForeignKeyDef {
    type Error = SchemaError;

    fn try_from(raw: RawForeignKeyDef) -> Result<Self, Self::Error> {
        ForeignKeyDef::new(raw.table, raw.columns, raw.ref_table, raw.ref_columns)
    }
}

impl ForeignKeyDef {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        ref_table: impl Into<String>,
        ref_columns: Vec<String>,
    ) -> Result<Self, SchemaError> {
        let table = table.into();
        let ref_table = ref_table.into();
        if columns.is_empty() {
            return Err(SchemaError::EmptyForeignKey(table));
        }
        if columns.len() != ref_columns.len() {
            return Err(SchemaError::ForeignKeyArity {
                table,
                columns,
                ref_table,
                ref_columns,
            });
        }
        Ok(Self {
            table,
            columns,
            ref_table,
            ref_columns,
        })
    }

    /// Join descriptor used as the relation name of the edge type,
    /// e.g. `"customer_id"` or `"a-b"` for composite keys.
    pub fn descriptor(&self) -> String {
        self.columns.join("-")
    }
}

// ============================================================================
// Tables and schema
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: IndexMap<String, ColumnDef>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

/// Ordered mapping from table name to [`TableSchema`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    tables: IndexMap<String, TableSchema>,
}

impl FromIterator<(String, TableSchema)> for Schema {
    fn from_iter<I: IntoIterator<Item = (String, TableSchema)>>(iter: I) -> Self {
        Self {
            tables: iter.into_iter().collect(),
        }
    }
}

impl Schema {
    pub fn new(tables: IndexMap<String, TableSchema>) -> Self {
        Self { tables }
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableSchema)> {
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

    /// List every violated invariant: a foreign key whose owning table,
    /// columns, referenced table or referenced columns do not exist.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (name, table) in &self.tables {
            for fk in &table.foreign_keys {
                if &fk.table != name {
                    problems.push(format!(
                        "foreign key listed under {name} belongs to {}",
                        fk.table
                    ));
                }
                for col in &fk.columns {
                    if !table.columns.contains_key(col) {
                        problems.push(format!("{name}.{col} does not exist"));
                    }
                }
                match self.tables.get(&fk.ref_table) {
                    None => problems.push(format!(
                        "{name} references missing table {}",
                        fk.ref_table
                    )),
                    Some(ref_table) => {
                        for col in &fk.ref_columns {
                            if !ref_table.columns.contains_key(col) {
                                problems.push(format!(
                                    "{name} references missing column {}.{col}",
                                    fk.ref_table
                                ));
                            }
                        }
                    }
                }
            }
        }
        problems
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Inconsistent(problems))
        }
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let w = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(w, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = fs::read_to_string(path)?;
        let schema: Schema = serde_json::from_str(&text)?;
        Ok(schema)
    }
}
