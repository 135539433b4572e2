//! Inspect a materialized graph: dump node layouts, column stats, edge
//! types, degree distributions and sample rows in a human-readable format.
//!
//! ## Usage
//!
//! ```sh
//! cargo run --release --bin inspect -- --graph-dir data/shop/materialized
//! cargo run --release --bin inspect -- --graph-dir data/shop/materialized --sample-rows 10
//! ```

use std::path::PathBuf;

use clap::Parser;
use relgraph::common::*;
use relgraph::graph::{EdgeIndex, HeteroGraph, NodeStore};

#[derive(Parser, Debug)]
#[command(about = "Inspect a materialized heterogeneous graph")]
struct Args {
    /// Directory written by `preprocess` (`<data-dir>/<dataset>/materialized`).
    #[arg(long)]
    graph_dir: PathBuf,

    /// Number of sample rows to dump per node type (0 to skip).
    #[arg(long, default_value_t = 5)]
    sample_rows: usize,

    /// Number of source nodes to show neighborhoods for, per edge type.
    #[arg(long, default_value_t = 3)]
    sample_nodes: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let graph = HeteroGraph::load(&args.graph_dir)?;

    let total_rows: usize = graph.nodes.values().map(NodeStore::num_rows).sum();
    let total_features: usize = graph.nodes.values().map(NodeStore::num_features).sum();

    // ── Overview ──────────────────────────────────────────────────────────
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  Graph: {}", args.graph_dir.display());
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node types: {:>10}", graph.nodes.len());
    println!("║  Edge types: {:>10}", graph.edges.len());
    println!("║  Nodes:      {total_rows:>10}");
    println!("║  Edges:      {:>10}", graph.num_edges());
    println!("║  Features:   {total_features:>10} (summed over node types)");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // ── Node types ───────────────────────────────────────────────────────
    for (ti, (name, store)) in graph.nodes.iter().enumerate() {
        println!("┌─ Node type {ti}: \"{name}\"");
        println!(
            "│  Rows: {}  Features: {}  Columns: {}",
            store.num_rows(),
            store.num_features(),
            store.columns.len()
        );
        println!("│");

        for (ci, col) in store.columns.iter().enumerate() {
            println!(
                "│  [{ci}] {} : {}  features [{}, {})",
                col.name,
                col.stype,
                col.offset,
                col.offset + col.width
            );
            if let Some(stats) = store.col_stats.get(&col.name) {
                print_stats(stats, "│      ");
            }
        }

        if let Some(label) = &store.label {
            println!("│");
            println!("│  Label: {} : {}", label.column, label.stype);
            print_stats(&label.stats, "│      ");
        }

        if args.sample_rows > 0 && !store.columns.is_empty() {
            print_sample_rows(store, args.sample_rows);
        }

        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    // ── Edge types ───────────────────────────────────────────────────────
    for (edge_type, index) in &graph.edges {
        let num_src = graph.node(&edge_type.src).map_or(0, NodeStore::num_rows);
        let num_dst = graph.node(&edge_type.dst).map_or(0, NodeStore::num_rows);
        println!("┌─ Edge type {edge_type}");
        println!("│  Edges: {}", index.len());
        if index.is_empty() {
            println!("└──────────────────────────────────────────────────────────────");
            println!();
            continue;
        }

        let (out, inc) = index.to_csr(num_src, num_dst);
        print_degrees("Out-degree", &out);
        print_degrees("In-degree ", &inc);

        if args.sample_nodes > 0 {
            print_neighborhoods(index, &out, args.sample_nodes);
        }
        println!("└──────────────────────────────────────────────────────────────");
        println!();
    }

    Ok(())
}

fn print_sample_rows(store: &NodeStore, limit: usize) {
    let n = store.num_rows();
    let show = n.min(limit);

    println!("│");
    println!("│  Sample rows (first {show} of {n}):");

    print!("│  {:>6}", "row");
    for col in &store.columns {
        let truncated: String = col.name.chars().take(12).collect();
        print!(" │ {truncated:>12}");
    }
    if store.label.is_some() {
        print!(" │ {:>12}", "label");
    }
    println!();

    print!("│  {:─>6}", "");
    for _ in &store.columns {
        print!("─┼─{:─>12}", "");
    }
    if store.label.is_some() {
        print!("─┼─{:─>12}", "");
    }
    println!();

    for row in 0..show {
        print!("│  {row:>6}");
        for col in &store.columns {
            let cell = store
                .column_slice(row, &col.name)
                .map(format_cell)
                .unwrap_or_default();
            let truncated: String = cell.chars().take(12).collect();
            print!(" │ {truncated:>12}");
        }
        if let Some(label) = &store.label {
            print!(" │ {:>12.4}", label.values[row]);
        }
        println!();
    }
    if n > show {
        println!("│  ... ({} more rows)", n - show);
    }
}

/// First value of a column's feature block, with the block width if wider.
fn format_cell(values: &[f32]) -> String {
    match values {
        [] => String::new(),
        [v] => format!("{v:.4}"),
        [v, ..] => format!("{v:.3}(+{})", values.len() - 1),
    }
}

fn print_degrees(label: &str, csr: &CsrGraph) {
    let n = csr.num_nodes();
    if n == 0 {
        return;
    }
    let mut degrees: Vec<u32> = (0..n as u32).map(|i| csr.degree(i)).collect();
    degrees.sort_unstable();
    let isolated = degrees.iter().take_while(|&&d| d == 0).count();
    let mean = csr.num_edges() as f64 / n as f64;
    let p99 = degrees[((n as f64 * 0.99) as usize).min(n - 1)];
    println!(
        "│  {label}: mean {mean:.2}  median {}  p99 {p99}  max {}  isolated {isolated}/{n}",
        degrees[n / 2],
        degrees[n - 1],
    );
}

fn print_neighborhoods(index: &EdgeIndex, out: &CsrGraph, limit: usize) {
    println!("│");
    let mut shown = 0;
    let mut seen = std::collections::BTreeSet::new();
    for (src, _) in index.pairs() {
        if shown == limit {
            break;
        }
        if !seen.insert(src) {
            continue;
        }
        let neighbors = out.neighbors(src);
        let preview: Vec<String> = neighbors.iter().take(8).map(u32::to_string).collect();
        let suffix = if neighbors.len() > 8 {
            format!(" ...+{}", neighbors.len() - 8)
        } else {
            String::new()
        };
        println!("│  {src:>6} → [{}]{suffix}", preview.join(", "));
        shown += 1;
    }
}

fn print_stats(stats: &ColumnStats, prefix: &str) {
    match stats {
        ColumnStats::Numerical {
            num_nulls,
            min,
            max,
            mean,
            std,
        } => {
            println!(
                "{prefix}nulls: {num_nulls}  min: {min:.4}  max: {max:.4}  mean: {mean:.4}  std: {std:.4}"
            );
        }
        ColumnStats::Timestamp {
            num_nulls,
            min_us,
            max_us,
            mean_us,
            std_us,
        } => {
            let fmt = |us: i64| -> String {
                chrono::DateTime::from_timestamp_micros(us)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| format!("{us}μs"))
            };
            println!(
                "{prefix}nulls: {num_nulls}  min: {}  max: {}",
                fmt(*min_us),
                fmt(*max_us)
            );
            println!("{prefix}mean: {mean_us:.0}μs  std: {std_us:.0}μs");
        }
        ColumnStats::Categorical {
            num_nulls,
            categories,
            counts,
        } => {
            let n = categories.len();
            let preview: Vec<String> = categories
                .iter()
                .zip(counts)
                .take(10)
                .map(|(c, k)| format!("{c} ({k})"))
                .collect();
            let suffix = if n > 10 {
                format!(" ...+{}", n - 10)
            } else {
                String::new()
            };
            println!("{prefix}nulls: {num_nulls}  categories: {n}");
            println!("{prefix}  [{}]{suffix}", preview.join(", "));
        }
        ColumnStats::TextEmbedded { num_nulls, dim } => {
            println!("{prefix}nulls: {num_nulls}  embedding dim: {dim}");
        }
    }
}
