//! Schema inference over an inspected database.
//!
//! For every table the analyzer classifies each column's declared storage
//! type, samples the table's rows (reservoir sampling with a seeded
//! [`SmallRng`], so the result is deterministic for a given seed), profiles
//! the sampled values and decides a [`ColumnDef`]. Foreign keys come straight
//! from the inspector's constraints.

use std::collections::HashSet;

use indexmap::IndexMap;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::inspector::{ColumnInfo, DbInspector, RowReader, SqlValue};
use crate::schema::{ColumnDef, ForeignKeyDef, Schema, TableSchema};
use crate::storage::{self, StorageClass};
use crate::stype::{CategoricalThreshold, ValueProfile};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Maximum number of rows sampled per table.
    pub sample_size: usize,
    /// Seed for row sampling.
    pub seed: u64,
    pub categorical: CategoricalThreshold,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sample_size: 10_000,
            seed: 0,
            categorical: CategoricalThreshold::default(),
        }
    }
}

// ============================================================================
// Analyzer
// ============================================================================

pub struct SchemaAnalyzer<'a, S> {
    source: &'a S,
    config: AnalyzerConfig,
}

impl<'a, S: DbInspector + RowReader> SchemaAnalyzer<'a, S> {
    pub fn new(source: &'a S, config: AnalyzerConfig) -> Self {
        Self { source, config }
    }

    /// Infer the schema of every table the source exposes.
    pub fn guess_schema(&self) -> crate::Result<Schema> {
        let tables = self.source.tables()?;
        let known: HashSet<&str> = tables.iter().map(String::as_str).collect();

        let mut out = IndexMap::with_capacity(tables.len());
        for table in &tables {
            let ts = self.guess_table(table, &known)?;
            info!(
                "  {table}: {} columns, {} foreign keys",
                ts.columns.len(),
                ts.foreign_keys.len()
            );
            out.insert(table.clone(), ts);
        }

        // Drop foreign keys whose referenced columns do not exist.
        let columns_of: IndexMap<String, HashSet<String>> = out
            .iter()
            .map(|(t, ts)| (t.clone(), ts.columns.keys().cloned().collect()))
            .collect();
        for ts in out.values_mut() {
            ts.foreign_keys.retain(|fk| {
                let ok = columns_of
                    .get(&fk.ref_table)
                    .is_some_and(|cols| fk.ref_columns.iter().all(|c| cols.contains(c)));
                if !ok {
                    warn!(
                        "Dropping foreign key {}({}) -> {}({}): referenced columns not found",
                        fk.table,
                        fk.columns.join(", "),
                        fk.ref_table,
                        fk.ref_columns.join(", ")
                    );
                }
                ok
            });
        }

        Ok(Schema::new(out))
    }

    /// Infer the schema of one table. `known_tables` are the tables foreign
    /// keys may point at.
    pub fn guess_table(
        &self,
        table: &str,
        known_tables: &HashSet<&str>,
    ) -> crate::Result<TableSchema> {
        let columns = self.source.columns(table)?;
        let foreign_keys = self.guess_foreign_keys(table, known_tables)?;

        let mut key_columns: HashSet<String> = self.source.primary_key(table)?.into_iter().collect();
        for fk in &foreign_keys {
            key_columns.extend(fk.columns.iter().cloned());
        }

        let dialect = self.source.dialect();
        let classes: Vec<StorageClass> = columns
            .iter()
            .map(|c| storage::classify(&c.declared_type, dialect))
            .collect();

        // Only columns whose decision depends on data are sampled.
        let sampled: Vec<&ColumnInfo> = columns
            .iter()
            .zip(&classes)
            .filter(|(c, class)| needs_sample(**class) && !key_columns.contains(&c.name))
            .map(|(c, _)| c)
            .collect();
        let mut profiles = self.sample_profiles(table, &sampled);

        let mut defs = IndexMap::with_capacity(columns.len());
        for (col, class) in columns.iter().zip(classes) {
            let is_key = key_columns.contains(&col.name);
            let def = if class == StorageClass::Unknown {
                warn!(
                    "{table}.{}: unknown storage type '{}', omitting",
                    col.name, col.declared_type
                );
                ColumnDef::Omit
            } else if needs_sample(class) && !is_key {
                match profiles.shift_remove(&col.name) {
                    Some(profile) => {
                        decide_column_def(class, &profile, false, &self.config.categorical)
                    }
                    None => {
                        warn!("{table}.{}: could not be sampled, omitting", col.name);
                        ColumnDef::Omit
                    }
                }
            } else {
                decide_column_def(class, &ValueProfile::new(), is_key, &self.config.categorical)
            };
            debug!("    {table}.{} [{}] -> {}", col.name, col.declared_type, def.kind_name());
            defs.insert(col.name.clone(), def);
        }

        Ok(TableSchema {
            columns: defs,
            foreign_keys,
        })
    }

    /// Single-column foreign keys to known tables. Composite and
    /// unresolvable keys are dropped with a warning.
    fn guess_foreign_keys(
        &self,
        table: &str,
        known_tables: &HashSet<&str>,
    ) -> crate::Result<Vec<ForeignKeyDef>> {
        let mut out = Vec::new();
        for (columns, constraint) in self.source.foreign_keys(table)? {
            let descr = format!("{table}({}) -> {}", columns.join(", "), constraint.ref_table);
            if columns.len() != 1 {
                warn!("Dropping multi-column foreign key {descr}");
                continue;
            }
            if !known_tables.contains(constraint.ref_table.as_str()) {
                warn!("Dropping foreign key {descr}: referenced table does not exist");
                continue;
            }
            let Some(ref_columns) = constraint.ref_columns else {
                warn!("Dropping foreign key {descr}: referenced columns are unknown");
                continue;
            };
            match ForeignKeyDef::new(table, columns, constraint.ref_table, ref_columns) {
                Ok(fk) => out.push(fk),
                Err(e) => warn!("Dropping foreign key {descr}: {e}"),
            }
        }
        Ok(out)
    }

    /// Profile the given columns over a reservoir sample of the table's rows.
    ///
    /// If the combined scan fails, every column is retried on its own so a
    /// single unreadable column does not cost the others their profiles.
    fn sample_profiles(
        &self,
        table: &str,
        columns: &[&ColumnInfo],
    ) -> IndexMap<String, ValueProfile> {
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        if names.is_empty() {
            return IndexMap::new();
        }
        match self.sample_rows(table, &names) {
            Ok(rows) => profile_rows(&names, &rows),
            Err(e) => {
                warn!("{table}: sampling failed ({e}), retrying column by column");
                let mut out = IndexMap::new();
                for name in names {
                    match self.sample_rows(table, std::slice::from_ref(&name)) {
                        Ok(rows) => {
                            out.extend(profile_rows(std::slice::from_ref(&name), &rows));
                        }
                        Err(e) => warn!("{table}.{name}: sampling failed: {e}"),
                    }
                }
                out
            }
        }
    }

    /// Reservoir-sample up to `sample_size` rows (Algorithm R).
    fn sample_rows(&self, table: &str, columns: &[String]) -> crate::Result<Vec<Vec<SqlValue>>> {
        let k = self.config.sample_size;
        let mut rng = SmallRng::seed_from_u64(self.config.seed);
        let mut reservoir: Vec<Vec<SqlValue>> = Vec::with_capacity(k.min(1 << 16));
        let mut seen: u64 = 0;
        self.source.for_each_row(table, columns, &mut |row| {
            if reservoir.len() < k {
                reservoir.push(row);
            } else {
                let j = rng.random_range(0..=seen) as usize;
                if j < k {
                    reservoir[j] = row;
                }
            }
            seen += 1;
            Ok(())
        })?;
        Ok(reservoir)
    }
}

fn profile_rows(names: &[String], rows: &[Vec<SqlValue>]) -> IndexMap<String, ValueProfile> {
    let mut profiles: Vec<ValueProfile> = names.iter().map(|_| ValueProfile::new()).collect();
    for row in rows {
        for (profile, value) in profiles.iter_mut().zip(row) {
            match value {
                SqlValue::Null => profile.observe_null(),
                SqlValue::Integer(i) => profile.observe_int(*i),
                SqlValue::Real(f) => profile.observe_float(*f),
                SqlValue::Text(s) => profile.observe_text(s),
                SqlValue::Blob(b) => profile.observe_text(&String::from_utf8_lossy(b)),
            }
        }
    }
    names.iter().cloned().zip(profiles).collect()
}

/// Whether the decision for a storage class looks at the data at all.
fn needs_sample(class: StorageClass) -> bool {
    matches!(
        class,
        StorageClass::Integer { .. }
            | StorageClass::Float { .. }
            | StorageClass::Decimal
            | StorageClass::Boolean
            | StorageClass::Enum
            | StorageClass::Set
            | StorageClass::Char
            | StorageClass::Text
    )
}

/// Decide the kind of a column from its storage class and sampled values.
///
/// Key columns are identifiers; they are omitted and their relationships are
/// carried by edges instead.
pub fn decide_column_def(
    class: StorageClass,
    profile: &ValueProfile,
    is_key: bool,
    threshold: &CategoricalThreshold,
) -> ColumnDef {
    let categorical = || ColumnDef::Categorical {
        cardinality: profile.num_distinct() as u32,
    };
    match class {
        StorageClass::Binary | StorageClass::Unknown => ColumnDef::Omit,
        _ if is_key => ColumnDef::Omit,
        StorageClass::Boolean | StorageClass::Enum | StorageClass::Set => categorical(),
        StorageClass::Date => ColumnDef::Date,
        StorageClass::DateTime => ColumnDef::DateTime,
        StorageClass::Time => ColumnDef::Duration,
        StorageClass::Integer { .. } => {
            if profile.is_low_cardinality(threshold) {
                categorical()
            } else {
                ColumnDef::Numeric
            }
        }
        StorageClass::Float { .. } | StorageClass::Decimal => {
            if profile.all_integral && profile.is_low_cardinality(threshold) {
                categorical()
            } else {
                ColumnDef::Numeric
            }
        }
        StorageClass::Char | StorageClass::Text => {
            if profile.num_non_null() == 0 {
                ColumnDef::Text
            } else if profile.all_date_text {
                ColumnDef::Date
            } else if profile.all_datetime_text {
                ColumnDef::DateTime
            } else if profile.is_low_cardinality(threshold) {
                categorical()
            } else if profile.all_numeric_text {
                ColumnDef::Numeric
            } else {
                ColumnDef::Text
            }
        }
    }
}
