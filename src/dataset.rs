//! A named dataset: its source, its local cache and the graph built from it.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/<name>/db/schema.json
//! <data_dir>/<name>/db/<table>.parquet
//! <data_dir>/<name>/materialized/
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{info, warn};

use crate::analyzer::{AnalyzerConfig, SchemaAnalyzer};
use crate::builder::{BuildReport, GraphBuilder};
use crate::config::{BuilderConfig, DatasetDefaults, DatasetRegistry};
use crate::database::Database;
use crate::embedder::TextEmbedder;
use crate::graph::HeteroGraph;
use crate::inspector::SqliteSource;
use crate::schema::Schema;

#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub data_dir: PathBuf,
    /// Persist a freshly downloaded database to the cache.
    pub save_db: bool,
    /// Ignore the cache and download again.
    pub force_remake: bool,
    pub progress: bool,
    pub analyzer: AnalyzerConfig,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            save_db: true,
            force_remake: false,
            progress: false,
            analyzer: AnalyzerConfig::default(),
        }
    }
}

/// What the cache directory holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Missing,
    Empty,
    Inconsistent(String),
    Ready,
}

/// Inspect a cache directory without loading table data.
pub fn cache_state(db_dir: &Path) -> CacheState {
    let schema_path = db_dir.join("schema.json");
    if !schema_path.exists() {
        return CacheState::Missing;
    }
    let schema = match Schema::load(&schema_path) {
        Ok(schema) => schema,
        Err(e) => return CacheState::Inconsistent(e.to_string()),
    };
    if schema.is_empty() {
        return CacheState::Empty;
    }
    if let Err(e) = schema.validate() {
        return CacheState::Inconsistent(e.to_string());
    }
    let missing: Vec<&str> = schema
        .table_names()
        .filter(|t| !db_dir.join(format!("{t}.parquet")).exists())
        .collect();
    if !missing.is_empty() {
        return CacheState::Inconsistent(format!("no data for {}", missing.join(", ")));
    }
    CacheState::Ready
}

pub struct Dataset {
    name: String,
    defaults: DatasetDefaults,
    root_dir: PathBuf,
    schema: Schema,
    db: Database,
}

impl Dataset {
    /// Load `name` from the cache, or download it from its source.
    pub fn open(name: &str, registry: &DatasetRegistry, options: &DatasetOptions) -> crate::Result<Self> {
        let defaults = registry.get(name)?.clone();
        let root_dir = options.data_dir.join(name);
        let db_dir = root_dir.join("db");

        let cached = if options.force_remake {
            info!("Remaking {name}: cache bypassed");
            None
        } else {
            match cache_state(&db_dir) {
                CacheState::Ready => match load_cache(&db_dir) {
                    Ok(loaded) => Some(loaded),
                    Err(e) => {
                        warn!("Cache for {name} is unreadable ({e}), remaking");
                        None
                    }
                },
                CacheState::Missing => None,
                CacheState::Empty => {
                    info!("Cache for {name} is empty, remaking");
                    None
                }
                CacheState::Inconsistent(reason) => {
                    warn!("Cache for {name} is inconsistent ({reason}), remaking");
                    None
                }
            }
        };

        let (db, schema) = match cached {
            Some(loaded) => {
                info!("Loaded {name} from {}", db_dir.display());
                loaded
            }
            None => {
                let (db, schema) = Self::make_db(&defaults.source, options)?;
                if options.save_db {
                    save_cache(&db_dir, &db, &schema)?;
                    info!("Saved {name} to {}", db_dir.display());
                }
                (db, schema)
            }
        };

        Ok(Self {
            name: name.to_string(),
            defaults,
            root_dir,
            schema,
            db,
        })
    }

    /// Inspect and download `source`. The connection is released before returning.
    pub fn make_db(source: &str, options: &DatasetOptions) -> crate::Result<(Database, Schema)> {
        let start = Instant::now();
        let src = SqliteSource::open(source)?;

        info!("Inspecting {}", src.path().display());
        let schema = SchemaAnalyzer::new(&src, options.analyzer.clone()).guess_schema()?;

        info!("Downloading {} tables", schema.len());
        let db = Database::download(&src, options.progress)?;
        src.close()?;

        info!(
            "  Materialized in {}",
            indicatif::HumanDuration(start.elapsed())
        );
        Ok((db, schema))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &DatasetDefaults {
        &self.defaults
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root_dir.join("db")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.db_dir().join("schema.json")
    }

    pub fn materialized_dir(&self) -> PathBuf {
        self.root_dir.join("materialized")
    }

    pub fn cache_state(&self) -> CacheState {
        cache_state(&self.db_dir())
    }

    /// Build the graph. The registry's target is used unless `config` names one.
    pub fn build_hetero_graph(
        &self,
        config: &BuilderConfig,
        embedder: &dyn TextEmbedder,
    ) -> crate::Result<(HeteroGraph, BuildReport)> {
        let mut config = config.clone();
        if config.target.is_none() {
            config.target = self.defaults.target.clone();
        }

        let (mut graph, report) = GraphBuilder::new(&self.schema, &self.db, &config, embedder).build()?;
        if config.reverse_edges {
            let added = graph.add_reverse_edges();
            info!("  Added {added} reverse edge types");
        }
        Ok((graph, report))
    }
}

fn load_cache(db_dir: &Path) -> crate::Result<(Database, Schema)> {
    let schema = Schema::load(&db_dir.join("schema.json"))?;
    let db = Database::load(db_dir, schema.table_names())?;
    Ok((db, schema))
}

/// Tables first, schema last: a cache with a schema file is complete.
fn save_cache(db_dir: &Path, db: &Database, schema: &Schema) -> crate::Result<()> {
    let schema_path = db_dir.join("schema.json");
    if schema_path.exists() {
        fs::remove_file(&schema_path)?;
    }
    db.save(db_dir)?;
    schema.save(&schema_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetRef;
    use crate::embedder::ZeroEmbedder;
    use crate::graph::EdgeType;
    use crate::inspector::tests::fixture_db;

    fn setup(dir: &Path, target: Option<&str>) -> (DatasetRegistry, DatasetOptions) {
        let source = fixture_db(dir);
        let mut registry = DatasetRegistry::default();
        registry.insert(
            "shop",
            DatasetDefaults {
                source: format!("sqlite://{}", source.display()),
                target: target.map(|t| TargetRef::parse(t).unwrap()),
            },
        );
        let options = DatasetOptions {
            data_dir: dir.join("data"),
            ..Default::default()
        };
        (registry, options)
    }

    #[test]
    fn test_open_downloads_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, options) = setup(dir.path(), None);

        let ds = Dataset::open("shop", &registry, &options).unwrap();
        assert_eq!(
            ds.schema().table_names().collect::<Vec<_>>(),
            ["customers", "orders", "shipments", "tracking"]
        );
        assert_eq!(ds.db().get("orders").unwrap().num_rows(), 3);
        assert_eq!(ds.cache_state(), CacheState::Ready);
        assert!(ds.schema_path().exists());

        // The second open must not touch the source.
        fs::remove_file(dir.path().join("shop.sqlite")).unwrap();
        let cached = Dataset::open("shop", &registry, &options).unwrap();
        assert_eq!(cached.schema(), ds.schema());
        assert_eq!(cached.db(), ds.db());

        let forced = DatasetOptions {
            force_remake: true,
            ..options.clone()
        };
        assert!(Dataset::open("shop", &registry, &forced).is_err());
    }

    #[test]
    fn test_no_save_db_leaves_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, mut options) = setup(dir.path(), None);
        options.save_db = false;
        let ds = Dataset::open("shop", &registry, &options).unwrap();
        assert_eq!(ds.cache_state(), CacheState::Missing);
        assert!(!ds.db_dir().exists());
    }

    #[test]
    fn test_broken_cache_is_remade() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, options) = setup(dir.path(), None);
        let ds = Dataset::open("shop", &registry, &options).unwrap();
        let db_dir = ds.db_dir();

        fs::remove_file(db_dir.join("orders.parquet")).unwrap();
        assert!(matches!(cache_state(&db_dir), CacheState::Inconsistent(_)));
        Dataset::open("shop", &registry, &options).unwrap();
        assert_eq!(cache_state(&db_dir), CacheState::Ready);

        fs::write(db_dir.join("schema.json"), "{}").unwrap();
        assert_eq!(cache_state(&db_dir), CacheState::Empty);
        let remade = Dataset::open("shop", &registry, &options).unwrap();
        assert_eq!(remade.schema().len(), 4);
        assert_eq!(cache_state(&db_dir), CacheState::Ready);
    }

    #[test]
    fn test_unknown_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, options) = setup(dir.path(), None);
        let err = Dataset::open("nope", &registry, &options).err().unwrap();
        assert!(matches!(
            err,
            crate::Error::Config(crate::config::ConfigError::UnknownDataset { .. })
        ));
    }

    #[test]
    fn test_build_hetero_graph_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, options) = setup(dir.path(), Some("orders.amount"));
        let ds = Dataset::open("shop", &registry, &options).unwrap();

        let embedder = ZeroEmbedder { dim: 8 };
        let (graph, _) = ds
            .build_hetero_graph(&BuilderConfig::default(), &embedder)
            .unwrap();

        let forward = EdgeType::new("orders", "customer_id", "customers");
        let edges = graph.edge(&forward).unwrap();
        assert_eq!(edges.pairs().collect::<Vec<_>>(), [(0, 0), (1, 1), (2, 0)]);
        assert_eq!(graph.edge(&forward.reverse()).unwrap(), &edges.transpose());
        assert_eq!(graph.edge_types().count() % 2, 0);

        let orders = graph.node("orders").unwrap();
        assert_eq!(orders.num_rows(), 3);
        assert!(orders.feature_column("amount").is_none());
        let label = orders.label.as_ref().unwrap();
        assert_eq!(label.values[..2], [5.5, 7.0]);
        assert!(label.values[2].is_nan());

        let customers = graph.node("customers").unwrap();
        assert_eq!(customers.num_rows(), 2);

        let no_reverse = BuilderConfig {
            reverse_edges: false,
            ..Default::default()
        };
        let (plain, _) = ds.build_hetero_graph(&no_reverse, &embedder).unwrap();
        assert_eq!(plain.edge_types().count() * 2, graph.edge_types().count());
    }
}
