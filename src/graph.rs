//! The heterogeneous graph produced by the [`GraphBuilder`](crate::builder::GraphBuilder).
//!
//! Node types are table names; every node store holds a row-major `f32`
//! feature matrix with one row per table row. Edge types are
//! `(source table, join descriptor, target table)` triples whose edge index
//! pairs source and target [`RowIdx`](crate::common::RowIdx) values.
//!
//! ## On-disk layout
//!
//! [`HeteroGraph::save`] writes a directory:
//! - `graph.json`        — node types, feature layout, column stats, edge types
//! - `nodes/<table>.bin` — header `[num_rows, num_features, has_label]` (u32),
//!                         then `num_rows * num_features` f32 features, then
//!                         `num_rows` f32 labels if present
//! - `edges/<n>.bin`     — header `[num_edges]` (u32), then the source rows,
//!                         then the target rows (u32 each)
//!
//! All values are in native byte order.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{ColumnStats, CsrGraph, RowIdx, Stype};

/// Prefix of the relation name of a reverse edge type.
pub const REVERSE_PREFIX: &str = "rev_";

// ============================================================================
// Edges
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeType {
    pub src: String,
    pub rel: String,
    pub dst: String,
    /// Added by [`HeteroGraph::add_reverse_edges`], not joined from a key.
    #[serde(default)]
    pub reversed: bool,
}

impl EdgeType {
    pub fn new(src: impl Into<String>, rel: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            rel: rel.into(),
            dst: dst.into(),
            reversed: false,
        }
    }

    /// The edge type with swapped endpoints. A forward type always gains the
    /// `rev_` prefix, whatever its relation name; reversing twice gives back
    /// the original type.
    pub fn reverse(&self) -> Self {
        let rel = if self.reversed {
            self.rel
                .strip_prefix(REVERSE_PREFIX)
                .unwrap_or(&self.rel)
                .to_string()
        } else {
            format!("{REVERSE_PREFIX}{}", self.rel)
        };
        Self {
            src: self.dst.clone(),
            rel,
            dst: self.src.clone(),
            reversed: !self.reversed,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.src, self.rel, self.dst)
    }
}

/// Two parallel arrays: edge `i` goes from source row `src[i]` to target row
/// `dst[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeIndex {
    pub src: Vec<u32>,
    pub dst: Vec<u32>,
}

impl EdgeIndex {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, u32)>) -> Self {
        let (src, dst) = pairs.into_iter().unzip();
        Self { src, dst }
    }

    pub fn push(&mut self, src: RowIdx, dst: RowIdx) {
        self.src.push(src.0);
        self.dst.push(dst.0);
    }

    pub fn len(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.src.iter().copied().zip(self.dst.iter().copied())
    }

    /// Same edges with source and target swapped.
    pub fn transpose(&self) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
        }
    }

    /// Outgoing and incoming CSR adjacency. Edges are ordered by source row
    /// (stable), so neighbor lists keep edge order.
    pub fn to_csr(&self, num_src: usize, num_dst: usize) -> (CsrGraph, CsrGraph) {
        let mut pairs: Vec<(u32, u32)> = self.pairs().collect();
        pairs.sort_by_key(|&(s, _)| s);
        let outgoing = CsrGraph::from_sorted_edges(num_src, &pairs);
        let incoming = outgoing.transpose(num_dst);
        (outgoing, incoming)
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// The slice of feature-matrix columns produced from one table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub stype: Stype,
    /// First feature-matrix column.
    pub offset: u32,
    pub width: u32,
}

/// Row-major `f32` matrix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    pub num_rows: usize,
    pub num_cols: usize,
    pub data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn zeros(num_rows: usize, num_cols: usize) -> Self {
        Self {
            num_rows,
            num_cols,
            data: vec![0.0; num_rows * num_cols],
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.num_cols..(i + 1) * self.num_cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.num_cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.num_cols + col] = value;
    }
}

/// Prediction target of a node type. Missing values are `NaN` (`-1` for
/// categorical codes). Timestamp targets are z-scores against `stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub column: String,
    pub stype: Stype,
    pub stats: ColumnStats,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStore {
    pub features: FeatureMatrix,
    pub columns: Vec<FeatureColumn>,
    pub col_stats: IndexMap<String, ColumnStats>,
    pub label: Option<Label>,
}

impl NodeStore {
    pub fn num_rows(&self) -> usize {
        self.features.num_rows
    }

    pub fn num_features(&self) -> usize {
        self.features.num_cols
    }

    pub fn feature_column(&self, name: &str) -> Option<&FeatureColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// The features of `row` produced from column `name`.
    pub fn column_slice(&self, row: usize, name: &str) -> Option<&[f32]> {
        let c = self.feature_column(name)?;
        let start = c.offset as usize;
        Some(&self.features.row(row)[start..start + c.width as usize])
    }
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeteroGraph {
    pub nodes: IndexMap<String, NodeStore>,
    pub edges: IndexMap<EdgeType, EdgeIndex>,
}

impl HeteroGraph {
    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn edge_types(&self) -> impl Iterator<Item = &EdgeType> {
        self.edges.keys()
    }

    pub fn node(&self, name: &str) -> Option<&NodeStore> {
        self.nodes.get(name)
    }

    pub fn edge(&self, edge_type: &EdgeType) -> Option<&EdgeIndex> {
        self.edges.get(edge_type)
    }

    pub fn num_edges(&self) -> usize {
        self.edges.values().map(EdgeIndex::len).sum()
    }

    /// Add the reverse of every forward edge type whose reverse is missing.
    /// Returns the number of edge types added.
    pub fn add_reverse_edges(&mut self) -> usize {
        let missing: Vec<(EdgeType, EdgeIndex)> = self
            .edges
            .iter()
            .filter(|(et, _)| !et.reversed && !self.edges.contains_key(&et.reverse()))
            .map(|(et, index)| (et.reverse(), index.transpose()))
            .collect();
        let added = missing.len();
        self.edges.extend(missing);
        added
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save(&self, dir: &Path) -> crate::Result<()> {
        fs::create_dir_all(dir.join("nodes"))?;
        fs::create_dir_all(dir.join("edges"))?;

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (name, store) in &self.nodes {
            let file = format!("nodes/{name}.bin");
            write_node_bin(store, &dir.join(&file))?;
            nodes.push(NodeManifest {
                name: name.clone(),
                file,
                num_rows: store.num_rows(),
                num_features: store.num_features(),
                columns: store.columns.clone(),
                col_stats: store.col_stats.clone(),
                label: store.label.as_ref().map(|l| LabelManifest {
                    column: l.column.clone(),
                    stype: l.stype,
                    stats: l.stats.clone(),
                }),
            });
        }

        let mut edges = Vec::with_capacity(self.edges.len());
        for (i, (edge_type, index)) in self.edges.iter().enumerate() {
            let file = format!("edges/{i}.bin");
            write_edge_bin(index, &dir.join(&file))?;
            edges.push(EdgeManifest {
                edge_type: edge_type.clone(),
                file,
                num_edges: index.len(),
            });
        }

        let manifest = GraphManifest { nodes, edges };
        let w = BufWriter::new(File::create(dir.join("graph.json"))?);
        serde_json::to_writer_pretty(w, &manifest)?;
        debug!("Saved graph to {}", dir.display());
        Ok(())
    }

    pub fn load(dir: &Path) -> crate::Result<Self> {
        let manifest: GraphManifest =
            serde_json::from_slice(&fs::read(dir.join("graph.json"))?)?;

        let mut nodes = IndexMap::with_capacity(manifest.nodes.len());
        for node in manifest.nodes {
            let path = dir.join(&node.file);
            let (features, labels) = read_node_bin(&path)?;
            if features.num_rows != node.num_rows
                || features.num_cols != node.num_features
                || labels.is_some() != node.label.is_some()
            {
                return Err(format_error(&path, "header does not match graph.json"));
            }
            let label = match (node.label, labels) {
                (Some(l), Some(values)) => Some(Label {
                    column: l.column,
                    stype: l.stype,
                    stats: l.stats,
                    values,
                }),
                _ => None,
            };
            nodes.insert(
                node.name,
                NodeStore {
                    features,
                    columns: node.columns,
                    col_stats: node.col_stats,
                    label,
                },
            );
        }

        let mut edges = IndexMap::with_capacity(manifest.edges.len());
        for edge in manifest.edges {
            let path = dir.join(&edge.file);
            let index = read_edge_bin(&path)?;
            if index.len() != edge.num_edges {
                return Err(format_error(&path, "edge count does not match graph.json"));
            }
            edges.insert(edge.edge_type, index);
        }

        Ok(Self { nodes, edges })
    }
}

#[derive(Serialize, Deserialize)]
struct GraphManifest {
    nodes: Vec<NodeManifest>,
    edges: Vec<EdgeManifest>,
}

#[derive(Serialize, Deserialize)]
struct NodeManifest {
    name: String,
    file: String,
    num_rows: usize,
    num_features: usize,
    columns: Vec<FeatureColumn>,
    col_stats: IndexMap<String, ColumnStats>,
    label: Option<LabelManifest>,
}

#[derive(Serialize, Deserialize)]
struct LabelManifest {
    column: String,
    stype: Stype,
    stats: ColumnStats,
}

#[derive(Serialize, Deserialize)]
struct EdgeManifest {
    edge_type: EdgeType,
    file: String,
    num_edges: usize,
}

// ============================================================================
// Flat binary files
// ============================================================================

fn format_error(path: &Path, reason: &str) -> crate::Error {
    crate::Error::Format {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Write a `&[u32]` slice as raw bytes.
fn write_u32_slice(w: &mut impl Write, s: &[u32]) -> std::io::Result<()> {
    // SAFETY: u32 has no padding and a well-defined memory layout.
    let bytes = unsafe {
        std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s))
    };
    w.write_all(bytes)
}

/// Write a `&[f32]` slice as raw bytes.
fn write_f32_slice(w: &mut impl Write, s: &[f32]) -> std::io::Result<()> {
    // SAFETY: f32 has no padding and a well-defined memory layout.
    let bytes = unsafe {
        std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s))
    };
    w.write_all(bytes)
}

fn read_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_node_bin(store: &NodeStore, path: &Path) -> crate::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    let header = [
        store.num_rows() as u32,
        store.num_features() as u32,
        store.label.is_some() as u32,
    ];
    write_u32_slice(&mut w, &header)?;
    write_f32_slice(&mut w, &store.features.data)?;
    if let Some(label) = &store.label {
        write_f32_slice(&mut w, &label.values)?;
    }
    w.flush()?;
    Ok(())
}

fn read_node_bin(path: &Path) -> crate::Result<(FeatureMatrix, Option<Vec<f32>>)> {
    let bytes = fs::read(path)?;
    if bytes.len() < 12 {
        return Err(format_error(path, "file too small for header"));
    }
    let header = read_u32s(&bytes[..12]);
    let (num_rows, num_cols, has_label) =
        (header[0] as usize, header[1] as usize, header[2] != 0);

    let feature_bytes = num_rows * num_cols * 4;
    let label_bytes = if has_label { num_rows * 4 } else { 0 };
    if bytes.len() != 12 + feature_bytes + label_bytes {
        return Err(format_error(
            path,
            &format!(
                "expected {} bytes for {num_rows}x{num_cols} features, found {}",
                12 + feature_bytes + label_bytes,
                bytes.len()
            ),
        ));
    }

    let features = FeatureMatrix {
        num_rows,
        num_cols,
        data: read_f32s(&bytes[12..12 + feature_bytes]),
    };
    let labels = has_label.then(|| read_f32s(&bytes[12 + feature_bytes..]));
    Ok((features, labels))
}

fn write_edge_bin(index: &EdgeIndex, path: &Path) -> crate::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_u32_slice(&mut w, &[index.len() as u32])?;
    write_u32_slice(&mut w, &index.src)?;
    write_u32_slice(&mut w, &index.dst)?;
    w.flush()?;
    Ok(())
}

fn read_edge_bin(path: &Path) -> crate::Result<EdgeIndex> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(format_error(path, "file too small for header"));
    }
    let n = read_u32s(&bytes[..4])[0] as usize;
    if bytes.len() != 4 + 8 * n {
        return Err(format_error(
            path,
            &format!("expected {} bytes for {n} edges, found {}", 4 + 8 * n, bytes.len()),
        ));
    }
    let values = read_u32s(&bytes[4..]);
    Ok(EdgeIndex {
        src: values[..n].to_vec(),
        dst: values[n..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> HeteroGraph {
        let mut g = HeteroGraph::default();
        let mut features = FeatureMatrix::zeros(3, 2);
        features.set(1, 0, 1.5);
        features.set(2, 1, -2.0);
        g.nodes.insert(
            "orders".into(),
            NodeStore {
                features,
                columns: vec![FeatureColumn {
                    name: "amount".into(),
                    stype: Stype::Numerical,
                    offset: 0,
                    width: 2,
                }],
                col_stats: IndexMap::from([(
                    "amount".to_string(),
                    ColumnStats::Numerical {
                        num_nulls: 0,
                        min: 0.0,
                        max: 1.0,
                        mean: 0.5,
                        std: 1.0,
                    },
                )]),
                label: Some(Label {
                    column: "status".into(),
                    stype: Stype::Categorical,
                    stats: ColumnStats::Categorical {
                        num_nulls: 0,
                        categories: vec!["ok".into()],
                        counts: vec![3],
                    },
                    values: vec![0.0, 0.0, -1.0],
                }),
            },
        );
        g.nodes.insert(
            "customers".into(),
            NodeStore {
                features: FeatureMatrix::zeros(2, 0),
                columns: Vec::new(),
                col_stats: IndexMap::new(),
                label: None,
            },
        );
        g.edges.insert(
            EdgeType::new("orders", "customer_id", "customers"),
            EdgeIndex::from_pairs([(0, 1), (1, 0), (2, 1)]),
        );
        g
    }

    #[test]
    fn test_edge_type_reverse_round_trip() {
        let et = EdgeType::new("a", "x_id", "b");
        let rev = et.reverse();
        assert_eq!((rev.src.as_str(), rev.rel.as_str(), rev.dst.as_str()), ("b", "rev_x_id", "a"));
        assert!(rev.reversed);
        assert_ne!(rev, EdgeType::new("b", "rev_x_id", "a"));
        assert_eq!(rev.reverse(), et);
    }

    #[test]
    fn test_rev_prefixed_foreign_keys_still_get_reversed() {
        let mut g = HeteroGraph::default();
        let ab = EdgeType::new("a", "rev_b", "b");
        let ba = EdgeType::new("b", "b", "a");
        g.edges.insert(ab.clone(), EdgeIndex::from_pairs([(0, 1), (1, 1)]));
        g.edges.insert(ba.clone(), EdgeIndex::from_pairs([(0, 0)]));

        assert_eq!(g.add_reverse_edges(), 2);
        assert_eq!(g.edges.len(), 4);
        assert_eq!(g.edge(&ab.reverse()).unwrap(), &g.edge(&ab).unwrap().transpose());
        assert_eq!(g.edge(&ba.reverse()).unwrap(), &g.edge(&ba).unwrap().transpose());
        assert_eq!(g.edge(&ab.reverse()).unwrap().src, vec![1, 1]);
        assert_eq!(ab.reverse().rel, "rev_rev_b");

        assert_eq!(g.add_reverse_edges(), 0);
        assert_eq!(g.edges.len(), 4);
    }

    #[test]
    fn test_add_reverse_edges_doubles_then_is_idempotent() {
        let mut g = sample_graph();
        let forward = EdgeType::new("orders", "customer_id", "customers");
        assert_eq!(g.add_reverse_edges(), 1);
        assert_eq!(g.edges.len(), 2);

        let rev = g.edge(&forward.reverse()).unwrap();
        let fwd = g.edge(&forward).unwrap();
        assert_eq!(rev.src, fwd.dst);
        assert_eq!(rev.dst, fwd.src);

        assert_eq!(g.add_reverse_edges(), 0);
        assert_eq!(g.edges.len(), 2);
    }

    #[test]
    fn test_self_referencing_edges_get_a_reverse_type() {
        let mut g = HeteroGraph::default();
        let forward = EdgeType::new("employees", "manager_id", "employees");
        g.edges.insert(forward.clone(), EdgeIndex::from_pairs([(1, 0), (2, 0)]));
        g.add_reverse_edges();
        assert_eq!(g.edges.len(), 2);
        let rev = g.edge(&forward.reverse()).unwrap();
        assert_eq!(forward.reverse().rel, "rev_manager_id");
        assert_eq!(rev.pairs().collect::<Vec<_>>(), [(0, 1), (0, 2)]);
    }

    #[test]
    fn test_to_csr() {
        let index = EdgeIndex::from_pairs([(2, 0), (0, 1), (0, 0)]);
        let (out, inc) = index.to_csr(3, 2);
        assert_eq!(out.neighbors(0), &[1, 0]);
        assert_eq!(out.degree(1), 0);
        assert_eq!(out.neighbors(2), &[0]);
        assert_eq!(inc.neighbors(0), &[0, 2]);
        assert_eq!(inc.neighbors(1), &[0]);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = sample_graph();
        g.add_reverse_edges();
        g.save(dir.path()).unwrap();
        let loaded = HeteroGraph::load(dir.path()).unwrap();
        assert_eq!(loaded, g);
        assert_eq!(
            loaded.node("orders").unwrap().column_slice(2, "amount"),
            Some(&[0.0, -2.0][..])
        );
    }

    #[test]
    fn test_load_rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        sample_graph().save(dir.path()).unwrap();
        let path = dir.path().join("edges/0.bin");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            HeteroGraph::load(dir.path()),
            Err(crate::Error::Format { .. })
        ));
    }
}
