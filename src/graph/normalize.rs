//! Symmetric adjacency normalization.
//!
//! Computes `D^-1/2 (A + I) D^-1/2` over a sparse edge list. Duplicate
//! `(src, dst)` entries are summed before normalization, and a node whose
//! degree is zero contributes zero weight.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A weighted directed edge. Undirected graphs list both directions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub src: usize,
    pub dst: usize,
    #[serde(default = "default_edge_weight")]
    pub weight: f64,
}

fn default_edge_weight() -> f64 {
    1.0
}

/// Add a unit self-loop to every node and normalize symmetrically.
///
/// Edges are returned sorted by `(src, dst)`, which keeps message passing
/// deterministic across runs. Indices are not range-checked here; the
/// graph store validates them before calling.
pub fn normalize_with_self_loops(edges: &[Edge], num_nodes: usize) -> Vec<Edge> {
    let mut merged: BTreeMap<(usize, usize), f64> = BTreeMap::new();
    for edge in edges {
        *merged.entry((edge.src, edge.dst)).or_insert(0.0) += edge.weight;
    }
    for node in 0..num_nodes {
        *merged.entry((node, node)).or_insert(0.0) += 1.0;
    }

    // Row sums
    let mut degree = vec![0.0f64; num_nodes];
    for (&(src, _), &weight) in &merged {
        degree[src] += weight;
    }
    let inv_sqrt: Vec<f64> = degree
        .iter()
        .map(|&d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 })
        .collect();

    merged
        .into_iter()
        .map(|((src, dst), weight)| Edge {
            src,
            dst,
            weight: inv_sqrt[src] * weight * inv_sqrt[dst],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weight_of(edges: &[Edge], src: usize, dst: usize) -> f64 {
        edges
            .iter()
            .find(|e| e.src == src && e.dst == dst)
            .map(|e| e.weight)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_isolated_nodes_get_unit_self_loop() {
        let normalized = normalize_with_self_loops(&[], 3);
        assert_eq!(normalized.len(), 3);
        for edge in &normalized {
            assert_eq!(edge.src, edge.dst);
            assert!((edge.weight - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_symmetric_pair() {
        // A = [[0,1],[1,0]] → A+I has degree 2 everywhere → every entry 0.5
        let edges = vec![
            Edge { src: 0, dst: 1, weight: 1.0 },
            Edge { src: 1, dst: 0, weight: 1.0 },
        ];
        let normalized = normalize_with_self_loops(&edges, 2);
        assert_eq!(normalized.len(), 4);
        for edge in &normalized {
            assert!((edge.weight - 0.5).abs() < 1e-12, "{:?}", edge);
        }
    }

    #[test]
    fn test_duplicates_are_summed() {
        let edges = vec![
            Edge { src: 0, dst: 1, weight: 0.5 },
            Edge { src: 0, dst: 1, weight: 0.5 },
            Edge { src: 1, dst: 0, weight: 1.0 },
        ];
        let normalized = normalize_with_self_loops(&edges, 2);
        assert_eq!(normalized.len(), 4);
        assert!((weight_of(&normalized, 0, 1) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_star_weights() {
        // Center 0 connected to 1 and 2: deg(0)=3, deg(1)=deg(2)=2
        let edges = vec![
            Edge { src: 0, dst: 1, weight: 1.0 },
            Edge { src: 1, dst: 0, weight: 1.0 },
            Edge { src: 0, dst: 2, weight: 1.0 },
            Edge { src: 2, dst: 0, weight: 1.0 },
        ];
        let normalized = normalize_with_self_loops(&edges, 3);
        let expected = 1.0 / (3.0f64 * 2.0).sqrt();
        assert!((weight_of(&normalized, 0, 1) - expected).abs() < 1e-12);
        assert!((weight_of(&normalized, 0, 0) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(weight_of(&normalized, 1, 2), 0.0);
    }
}
