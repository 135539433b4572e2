//! Preprocessor binary: materializes a registered relational database and
//! turns it into a heterogeneous graph.
//!
//! ## Input
//!
//! A JSON registry mapping dataset names to a SQLite source and an optional
//! `table.column` prediction target.
//!
//! ## Output
//!
//! Under `<data-dir>/<dataset>/`:
//! - `db/schema.json`, `db/<table>.parquet` — the cached database
//! - `materialized/graph.json`             — node layout, column stats, edge types
//! - `materialized/nodes/<table>.bin`      — row-major f32 features, then the label
//! - `materialized/edges/<n>.bin`          — edge index per edge type
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin preprocess -- --registry datasets.json --dataset shop
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indicatif::{HumanCount, HumanDuration};
use tracing::{info, warn};

use relgraph::analyzer::AnalyzerConfig;
use relgraph::config::{BuilderConfig, CategoricalEncoding, DatasetRegistry};
use relgraph::dataset::{Dataset, DatasetOptions};
use relgraph::embedder::{ApiEmbedder, DEFAULT_EMBEDDING_DIM, EmbedderConfig, TextEmbedder, ZeroEmbedder};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(about = "Materialize a relational database into a heterogeneous graph")]
struct Args {
    /// Name of the dataset in the registry.
    #[arg(long)]
    dataset: String,

    /// Top-level data directory; the dataset lives in `<data-dir>/<dataset>/`.
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// JSON registry of known datasets.
    #[arg(long, default_value = "datasets.json")]
    registry: PathBuf,

    /// Download again even if a cached copy exists.
    #[arg(long, default_value_t = false)]
    force_remake: bool,

    /// Do not write the downloaded database to the cache.
    #[arg(long, default_value_t = false)]
    no_save_db: bool,

    /// Skip embedding (use zero vectors). Useful for testing the pipeline
    /// without the embedding API.
    #[arg(long, default_value_t = false)]
    skip_embeddings: bool,

    /// Embedding batch size (strings per API request).
    #[arg(long, default_value_t = relgraph::embedder::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Rows sampled per table for schema inference.
    #[arg(long, default_value_t = 10_000)]
    sample_size: usize,

    /// Seed for row sampling.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = CategoricalEncoding::Code)]
    categorical_encoding: CategoricalEncoding,

    /// Keep only the foreign-key direction of every edge type.
    #[arg(long, default_value_t = false)]
    no_reverse_edges: bool,
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let pipeline_start = Instant::now();

    info!("Dataset:  {}", args.dataset);
    info!("Registry: {}", args.registry.display());
    info!("Data dir: {}", args.data_dir.display());

    // ── Step 1: Materialize the database ───────────────────────────────
    info!("Step 1: Materializing database...");
    let registry = DatasetRegistry::load(&args.registry)?;
    let options = DatasetOptions {
        data_dir: args.data_dir.clone(),
        save_db: !args.no_save_db,
        force_remake: args.force_remake,
        progress: true,
        analyzer: AnalyzerConfig {
            sample_size: args.sample_size,
            seed: args.seed,
            ..Default::default()
        },
    };
    let dataset = Dataset::open(&args.dataset, &registry, &options)?;
    info!(
        "  {} tables, {} rows",
        dataset.db().len(),
        HumanCount(dataset.db().total_rows() as u64)
    );

    // ── Step 2: Set up the embedder ────────────────────────────────────
    info!("Step 2: Setting up text embedder...");
    let embedder: Box<dyn TextEmbedder> = if args.skip_embeddings {
        info!("  Skipping embeddings (zero vectors)");
        Box::new(ZeroEmbedder {
            dim: DEFAULT_EMBEDDING_DIM,
        })
    } else {
        let config = EmbedderConfig::from_env()?;
        info!("  Embedding via {}", config.base_url);
        Box::new(ApiEmbedder::new(config)?)
    };

    // ── Step 3: Build the graph ────────────────────────────────────────
    info!("Step 3: Building heterogeneous graph...");
    let config = BuilderConfig {
        categorical_encoding: args.categorical_encoding,
        text_batch_size: args.batch_size,
        reverse_edges: !args.no_reverse_edges,
        progress: true,
        ..Default::default()
    };
    let (graph, report) = dataset.build_hetero_graph(&config, embedder.as_ref())?;
    info!(
        "  {} node types, {} edge types, {} edges",
        graph.nodes.len(),
        graph.edges.len(),
        HumanCount(graph.num_edges() as u64)
    );
    if !report.is_clean() {
        warn!("Build report: {report}");
    }

    // ── Step 4: Save ───────────────────────────────────────────────────
    let out_dir = dataset.materialized_dir();
    info!("Step 4: Saving graph to {}...", out_dir.display());
    graph.save(&out_dir)?;

    info!(
        "Done in {}",
        HumanDuration(pipeline_start.elapsed())
    );
    Ok(())
}
