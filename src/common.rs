//! Common types and constants used throughout the project.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, Timelike, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

// ============================================================================
// Statistical types
// ============================================================================

/// Database columns have "storage types": the primitive types a column is stored as.
/// They also have "statistical types": the role the data plays for modelling.
/// The statistical type decides which converter encodes the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stype {
    Categorical = 0,
    Numerical = 1,
    Timestamp = 2,
    TextEmbedded = 3,
}

impl std::fmt::Display for Stype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stype::Categorical => "categorical",
            Stype::Numerical => "numerical",
            Stype::Timestamp => "timestamp",
            Stype::TextEmbedded => "text_embedded",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Index NewTypes
// ============================================================================

/// Position of a row inside its table. Tables are dense: a table with `n`
/// rows has exactly the identifiers `0..n`, assigned when the table is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowIdx(pub u32);

// ============================================================================
// Column statistics
// ============================================================================

/// Per-column statistics, determined while materializing node features.
/// Each variant carries only the stats meaningful for that statistical type,
/// and is enough to reproduce the scaling downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stype", rename_all = "snake_case")]
pub enum ColumnStats {
    /// Numerical columns: z-score normalization parameters.
    Numerical {
        num_nulls: u64,
        min: f64,
        max: f64,
        mean: f64,
        std: f64,
    },

    /// Timestamps, in epoch microseconds.
    ///
    /// `mean_us` and `std_us` are `f64` to avoid overflow during accumulation.
    Timestamp {
        num_nulls: u64,
        min_us: i64,
        max_us: i64,
        mean_us: f64,
        std_us: f64,
    },

    /// Categoricals: the vocabulary, most frequent first, and the count of
    /// each entry. A value's code is its position in `categories`.
    Categorical {
        num_nulls: u64,
        categories: Vec<String>,
        counts: Vec<u64>,
    },

    /// Text: null count and the embedding width.
    TextEmbedded { num_nulls: u64, dim: u32 },
}

impl ColumnStats {
    pub fn stype(&self) -> Stype {
        match self {
            ColumnStats::Numerical { .. } => Stype::Numerical,
            ColumnStats::Timestamp { .. } => Stype::Timestamp,
            ColumnStats::Categorical { .. } => Stype::Categorical,
            ColumnStats::TextEmbedded { .. } => Stype::TextEmbedded,
        }
    }

    pub fn num_nulls(&self) -> u64 {
        match self {
            ColumnStats::Numerical { num_nulls, .. }
            | ColumnStats::Timestamp { num_nulls, .. }
            | ColumnStats::Categorical { num_nulls, .. }
            | ColumnStats::TextEmbedded { num_nulls, .. } => *num_nulls,
        }
    }
}

// ============================================================================
// Timestamp Encoding Constants
// ============================================================================

/// Number of cyclic component pairs in the timestamp encoding.
/// Levels: second_of_minute, minute_of_hour, hour_of_day,
///         day_of_week, day_of_month, month_of_year, day_of_year.
pub const TIMESTAMP_CYCLIC_PAIRS: usize = 7;

/// Total float dimension per timestamp cell: 7 sin/cos pairs + 1 z-scored value of epoch microseconds.
pub const TIMESTAMP_DIM: usize = TIMESTAMP_CYCLIC_PAIRS * 2 + 1; // = 15

/// Indices into the 15-element timestamp feature vector.
/// Each cyclic level occupies two consecutive slots: [sin, cos].
pub const TS_SECOND_OF_MINUTE: usize = 0; // slots 0, 1
pub const TS_MINUTE_OF_HOUR: usize = 2; // slots 2, 3
pub const TS_HOUR_OF_DAY: usize = 4; // slots 4, 5
pub const TS_DAY_OF_WEEK: usize = 6; // slots 6, 7
pub const TS_DAY_OF_MONTH: usize = 8; // slots 8, 9
pub const TS_MONTH_OF_YEAR: usize = 10; // slots 10, 11
pub const TS_DAY_OF_YEAR: usize = 12; // slots 12, 13
pub const TS_ZSCORE_EPOCH: usize = 14; // slot 14

/// Encode a single timestamp (epoch microseconds) into the 15-element feature vector.
pub fn encode_timestamp(us: i64, mean_us: f64, std_us: f64) -> [f32; TIMESTAMP_DIM] {
    let mut out = [0.0f32; TIMESTAMP_DIM];

    let dt = DateTime::<Utc>::from_timestamp_micros(us)
        .unwrap_or_default()
        .naive_utc();

    let cyclic = |val: f64, period: f64| -> (f32, f32) {
        let angle = 2.0 * PI * val / period;
        (angle.sin() as f32, angle.cos() as f32)
    };

    let levels = [
        (TS_SECOND_OF_MINUTE, dt.second() as f64, 60.0),
        (TS_MINUTE_OF_HOUR, dt.minute() as f64, 60.0),
        (TS_HOUR_OF_DAY, dt.hour() as f64, 24.0),
        (TS_DAY_OF_WEEK, dt.weekday().num_days_from_monday() as f64, 7.0),
        (TS_DAY_OF_MONTH, (dt.day() - 1) as f64, 31.0),
        (TS_MONTH_OF_YEAR, (dt.month() - 1) as f64, 12.0),
        (TS_DAY_OF_YEAR, (dt.ordinal() - 1) as f64, 366.0),
    ];
    for (slot, val, period) in levels {
        let (s, c) = cyclic(val, period);
        out[slot] = s;
        out[slot + 1] = c;
    }

    out[TS_ZSCORE_EPOCH] = if std_us > 0.0 {
        ((us as f64 - mean_us) / std_us) as f32
    } else {
        0.0
    };

    out
}

// ============================================================================
// Topology (Graph) Components
// ============================================================================

/// CSR (Compressed Sparse Row) representation of a directed bipartite edge set.
///
/// Source nodes are rows `0..num_nodes()`; `col_idx` holds target row ids.
/// Built from an [`EdgeIndex`](crate::graph::EdgeIndex) with
/// [`EdgeIndex::to_csr`](crate::graph::EdgeIndex::to_csr).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrGraph {
    /// `row_ptr[i]` is the start offset in `col_idx` for node `i`.
    /// `row_ptr[i+1] - row_ptr[i]` is the degree of node `i`.
    /// Length = `num_nodes + 1`.
    pub row_ptr: Vec<u32>,
    /// Packed neighbor lists. Neighbors of node `i` are
    /// `col_idx[row_ptr[i]..row_ptr[i+1]]`.
    pub col_idx: Vec<u32>,
}

impl CsrGraph {
    /// Number of source nodes in the graph.
    pub fn num_nodes(&self) -> usize {
        self.row_ptr.len().saturating_sub(1)
    }

    /// Number of edges in the graph.
    pub fn num_edges(&self) -> usize {
        self.col_idx.len()
    }

    /// Return the neighbors of `node` as a slice.
    pub fn neighbors(&self, node: u32) -> &[u32] {
        let start = self.row_ptr[node as usize] as usize;
        let end = self.row_ptr[node as usize + 1] as usize;
        &self.col_idx[start..end]
    }

    /// Degree (number of neighbors) of `node`.
    pub fn degree(&self, node: u32) -> u32 {
        self.row_ptr[node as usize + 1] - self.row_ptr[node as usize]
    }

    /// Build a CSR from edges that are **already sorted by source node**.
    ///
    /// # Panics (debug builds)
    /// - If `edges` is not sorted by source node.
    pub fn from_sorted_edges(num_nodes: usize, edges: &[(u32, u32)]) -> Self {
        debug_assert!(
            edges.windows(2).all(|w| w[0].0 <= w[1].0),
            "edges must be sorted by source node"
        );

        let mut row_ptr = Vec::with_capacity(num_nodes + 1);
        let mut col_idx = Vec::with_capacity(edges.len());
        let mut current_node = 0u32;
        row_ptr.push(0);

        for &(src, dst) in edges {
            // Fill in row_ptr entries for nodes with no outgoing edges.
            while current_node < src {
                row_ptr.push(col_idx.len() as u32);
                current_node += 1;
            }
            col_idx.push(dst);
        }

        // Pad trailing nodes that have no edges.
        while row_ptr.len() <= num_nodes {
            row_ptr.push(col_idx.len() as u32);
        }

        Self { row_ptr, col_idx }
    }

    /// Compute the transpose in O(V + E) time using a counting sort.
    ///
    /// The graph is bipartite, so the caller supplies the number of target
    /// nodes, which become the source nodes of the transpose.
    pub fn transpose(&self, num_targets: usize) -> Self {
        let num_nodes = self.num_nodes();
        let num_edges = self.num_edges();

        // Pass 1: count in-degree of each target, shifted by one so the
        // prefix sum directly produces row_ptr.
        let mut row_ptr = vec![0u32; num_targets + 1];
        for &dst in &self.col_idx {
            row_ptr[dst as usize + 1] += 1;
        }
        for i in 1..=num_targets {
            row_ptr[i] += row_ptr[i - 1];
        }

        // Pass 2: scatter source nodes into col_idx.
        let mut col_idx = vec![0u32; num_edges];
        let mut write_cursor = row_ptr[..num_targets].to_vec();
        for src in 0..num_nodes {
            let start = self.row_ptr[src] as usize;
            let end = self.row_ptr[src + 1] as usize;
            for &dst in &self.col_idx[start..end] {
                let pos = write_cursor[dst as usize] as usize;
                col_idx[pos] = src as u32;
                write_cursor[dst as usize] += 1;
            }
        }

        Self { row_ptr, col_idx }
    }
}

// ============================================================================
// Progress reporting
// ============================================================================

/// A bar of `len` steps drawn with `template`, or a hidden bar when
/// `enabled` is false.
pub fn progress_bar(len: u64, template: &str, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(template) {
        pb.set_style(style.progress_chars("##-"));
    }
    pb
}
