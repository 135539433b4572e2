//! Dataset registry and graph-builder settings.
//!
//! The registry is a JSON object mapping dataset names to their source and
//! prediction target:
//!
//! ```json
//! {
//!   "shop": { "source": "sqlite://data/shop.sqlite", "target": "orders.status" },
//!   "lib":  { "source": "data/library.db", "target": null }
//! }
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stype::CategoricalThreshold;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown dataset '{name}' (known: {})", known.join(", "))]
    UnknownDataset { name: String, known: Vec<String> },

    #[error("target must be written as <table>.<column>, got '{0}'")]
    InvalidTarget(String),

    #[error("target {0} does not exist in the schema")]
    TargetNotFound(TargetRef),

    #[error("target {target} has statistical type {stype}, which cannot be a label")]
    UnsupportedTarget {
        target: TargetRef,
        stype: crate::common::Stype,
    },

    #[error("failed to read registry {}: {source}", path.display())]
    ReadRegistry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed registry {}: {source}", path.display())]
    ParseRegistry {
        path: PathBuf,
        source: serde_json::Error,
    },
}

// ============================================================================
// Targets
// ============================================================================

/// A `table.column` reference to the prediction target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetRef {
    pub table: String,
    pub column: String,
}

impl TargetRef {
    /// Split on the first `.`; both halves must be non-empty.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.split_once('.') {
            Some((table, column)) if !table.is_empty() && !column.is_empty() => Ok(Self {
                table: table.to_string(),
                column: column.to_string(),
            }),
            _ => Err(ConfigError::InvalidTarget(s.to_string())),
        }
    }
}

impl TryFrom<String> for TargetRef {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TargetRef> for String {
    fn from(t: TargetRef) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Where a dataset lives and what it predicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefaults {
    /// `sqlite://<path>` or a plain file path.
    pub source: String,
    #[serde(default)]
    pub target: Option<TargetRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetRegistry {
    datasets: IndexMap<String, DatasetDefaults>,
}

impl DatasetRegistry {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::ReadRegistry {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::ParseRegistry {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, defaults: DatasetDefaults) {
        self.datasets.insert(name.into(), defaults);
    }

    pub fn get(&self, name: &str) -> Result<&DatasetDefaults, ConfigError> {
        self.datasets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownDataset {
                name: name.to_string(),
                known: self.datasets.keys().cloned().collect(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }
}

// ============================================================================
// Builder settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalEncoding {
    /// One feature column holding the vocabulary code.
    #[default]
    Code,
    /// One indicator column per vocabulary entry.
    OneHot,
}

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub categorical_encoding: CategoricalEncoding,
    /// Fill for null numerical values; `None` uses the column mean.
    pub numeric_fill: Option<f64>,
    /// Fill for null text before embedding.
    pub text_fill: String,
    pub text_batch_size: usize,
    /// Thresholds for inferring the type of columns the schema omits.
    pub categorical: CategoricalThreshold,
    pub target: Option<TargetRef>,
    /// Add the reverse of every edge type after building.
    pub reverse_edges: bool,
    pub progress: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            categorical_encoding: CategoricalEncoding::Code,
            numeric_fill: None,
            text_fill: String::new(),
            text_batch_size: crate::embedder::DEFAULT_BATCH_SIZE,
            categorical: CategoricalThreshold::default(),
            target: None,
            reverse_edges: true,
            progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parse() {
        let t = TargetRef::parse("loan.status").unwrap();
        assert_eq!(t.table, "loan");
        assert_eq!(t.column, "status");
        assert_eq!(t.to_string(), "loan.status");
        // Only the first dot splits.
        assert_eq!(TargetRef::parse("a.b.c").unwrap().column, "b.c");
        assert!(TargetRef::parse("nodot").is_err());
        assert!(TargetRef::parse(".col").is_err());
        assert!(TargetRef::parse("table.").is_err());
    }

    #[test]
    fn test_registry_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        fs::write(
            &path,
            r#"{
                "shop": {"source": "sqlite://shop.sqlite", "target": "orders.status"},
                "lib": {"source": "lib.db", "target": null},
                "bare": {"source": "bare.db"}
            }"#,
        )
        .unwrap();
        let reg = DatasetRegistry::load(&path).unwrap();
        assert_eq!(reg.names().collect::<Vec<_>>(), ["shop", "lib", "bare"]);
        let shop = reg.get("shop").unwrap();
        assert_eq!(shop.target, Some(TargetRef::parse("orders.status").unwrap()));
        assert_eq!(reg.get("bare").unwrap().target, None);

        let err = reg.get("nope").unwrap_err();
        assert!(err.to_string().contains("shop, lib, bare"));
    }

    #[test]
    fn test_registry_rejects_bad_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("datasets.json");
        fs::write(&path, r#"{"x": {"source": "x.db", "target": "nodot"}}"#).unwrap();
        assert!(matches!(
            DatasetRegistry::load(&path),
            Err(ConfigError::ParseRegistry { .. })
        ));
        assert!(matches!(
            DatasetRegistry::load(&dir.path().join("missing.json")),
            Err(ConfigError::ReadRegistry { .. })
        ));
    }
}
