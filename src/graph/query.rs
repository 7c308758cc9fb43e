//! Validated sets of node indices.

use std::collections::HashSet;

use candle_core::Tensor;

use super::store::GraphStore;
use crate::error::{TrainError, TrainResult};

/// A non-empty set of distinct, in-range node indices.
///
/// Holds the indices on the host, as a `u32` tensor for gathers and scatters,
/// and as a `[N, 1]` row mask used to overwrite exactly the queried rows.
#[derive(Debug, Clone)]
pub struct QuerySet {
    nodes: Vec<usize>,
    indices: Tensor,
    row_mask: Tensor,
}

impl QuerySet {
    pub fn new(nodes: Vec<usize>, graph: &GraphStore) -> TrainResult<Self> {
        let num_nodes = graph.num_nodes();
        if nodes.is_empty() {
            return Err(TrainError::InvalidQuery("query set is empty".into()));
        }

        let mut seen = HashSet::with_capacity(nodes.len());
        let mut mask = vec![0u8; num_nodes];
        for &node in &nodes {
            if node >= num_nodes {
                return Err(TrainError::IndexOutOfRange {
                    index: node,
                    num_nodes,
                });
            }
            if !seen.insert(node) {
                return Err(TrainError::InvalidQuery(format!(
                    "node {} appears twice",
                    node
                )));
            }
            mask[node] = 1;
        }

        let device = graph.device();
        let as_u32: Vec<u32> = nodes.iter().map(|&n| n as u32).collect();
        let len = as_u32.len();
        Ok(Self {
            indices: Tensor::from_vec(as_u32, len, device)?,
            row_mask: Tensor::from_vec(mask, (num_nodes, 1), device)?,
            nodes,
        })
    }

    pub fn nodes(&self) -> &[usize] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `u32` tensor of shape `[Q]`.
    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    /// `u8` tensor of shape `[N, 1]`, one where the row is queried.
    pub fn row_mask(&self) -> &Tensor {
        &self.row_mask
    }

    /// Row mask broadcast to `[N, width]`, ready for `where_cond`.
    pub fn row_mask_for(&self, width: usize) -> TrainResult<Tensor> {
        let (num_nodes, _) = self.row_mask.dims2()?;
        Ok(self.row_mask.broadcast_as((num_nodes, width))?.contiguous()?)
    }

    /// Positions (within this query) whose node satisfies `keep`.
    pub fn positions_where(&self, keep: &[bool]) -> Vec<u32> {
        keep.iter()
            .enumerate()
            .filter(|(_, &k)| k)
            .map(|(pos, _)| pos as u32)
            .collect()
    }
}
