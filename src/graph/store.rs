//! Fixed graph structure and per-node static features.
//!
//! The store is built once and never changes shape. Node order is fixed for
//! the lifetime of the run: labels, roles, token rows and cache rows all share
//! the same index.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::normalize::{normalize_with_self_loops, Edge};
use super::query::QuerySet;
use crate::error::{TrainError, TrainResult};

// ============================================================================
// Node roles
// ============================================================================

/// Evaluation split of a document node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    #[serde(alias = "val")]
    Validation,
    Test,
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Train => write!(f, "train"),
            Self::Validation => write!(f, "validation"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// Role of a node in the graph.
///
/// A node holds exactly one role, so split membership is disjoint by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    /// A document carrying text and a label.
    Content(Split),
    /// A vocabulary item: no text, no label, never refreshed.
    Structural,
}

impl NodeRole {
    pub fn is_content(&self) -> bool {
        matches!(self, Self::Content(_))
    }

    pub fn split(&self) -> Option<Split> {
        match self {
            Self::Content(split) => Some(*split),
            Self::Structural => None,
        }
    }
}

/// Per-role node counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitCounts {
    pub train: usize,
    pub validation: usize,
    pub test: usize,
    pub structural: usize,
}

impl SplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.validation + self.test + self.structural
    }

    pub fn documents(&self) -> usize {
        self.train + self.validation + self.test
    }
}

// ============================================================================
// Adjacency
// ============================================================================

/// Normalized sparse adjacency, held on the compute device.
///
/// Messages flow from `src` to `dst`; a layer aggregates over each node's
/// incoming edges.
#[derive(Debug, Clone)]
pub struct Adjacency {
    num_nodes: usize,
    num_edges: usize,
    src: Tensor,
    dst: Tensor,
    weight: Tensor,
    dst_nodes: Vec<u32>,
}

impl Adjacency {
    fn from_edges(edges: &[Edge], num_nodes: usize, device: &Device) -> TrainResult<Self> {
        let src: Vec<u32> = edges.iter().map(|e| e.src as u32).collect();
        let dst: Vec<u32> = edges.iter().map(|e| e.dst as u32).collect();
        let weight: Vec<f32> = edges.iter().map(|e| e.weight as f32).collect();
        let num_edges = edges.len();
        Ok(Self {
            num_nodes,
            num_edges,
            src: Tensor::from_vec(src, num_edges, device)?,
            dst: Tensor::from_vec(dst.clone(), num_edges, device)?,
            weight: Tensor::from_vec(weight, num_edges, device)?,
            dst_nodes: dst,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// Source node of every edge, `u32` of shape `[E]`.
    pub fn src(&self) -> &Tensor {
        &self.src
    }

    /// Destination node of every edge, `u32` of shape `[E]`.
    pub fn dst(&self) -> &Tensor {
        &self.dst
    }

    /// Normalized edge weight, `f32` of shape `[E]`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Sum per-edge messages `[E, ...]` into their destination nodes `[N, ...]`.
    pub fn scatter_to_dst(&self, messages: &Tensor) -> TrainResult<Tensor> {
        let mut shape = messages.dims().to_vec();
        shape[0] = self.num_nodes;
        let zeros = Tensor::zeros(shape, messages.dtype(), messages.device())?;
        Ok(zeros.index_add(&self.dst, messages, 0)?)
    }

    /// Largest edge score `[E, H]` arriving at each destination, as a constant `[N, H]`.
    ///
    /// Nodes without incoming edges get 0.
    pub fn max_per_dst(&self, scores: &Tensor) -> TrainResult<Tensor> {
        let heads = scores.dim(1)?;
        let values: Vec<Vec<f32>> = scores.detach().to_dtype(DType::F32)?.to_vec2()?;
        let mut max = vec![f32::NEG_INFINITY; self.num_nodes * heads];
        for (edge, &dst) in values.iter().zip(&self.dst_nodes) {
            let start = dst as usize * heads;
            for (slot, &value) in max[start..start + heads].iter_mut().zip(edge) {
                if value > *slot {
                    *slot = value;
                }
            }
        }
        for slot in &mut max {
            if *slot == f32::NEG_INFINITY {
                *slot = 0.0;
            }
        }
        let max = Tensor::from_vec(max, (self.num_nodes, heads), scores.device())?;
        Ok(max.to_dtype(scores.dtype())?)
    }
}

// ============================================================================
// Graph store
// ============================================================================

/// Raw parts a graph store is assembled from.
///
/// `input_ids` and `attention_mask` are row-major `[num_nodes * max_length]`.
/// Rows of structural nodes are zeroed regardless of what the caller passes.
#[derive(Debug, Clone)]
pub struct GraphParts {
    pub num_classes: usize,
    pub max_length: usize,
    pub roles: Vec<NodeRole>,
    pub labels: Vec<Option<u32>>,
    pub edges: Vec<Edge>,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<f32>,
}

/// The fixed graph, its static node features, labels and split roles.
#[derive(Debug)]
pub struct GraphStore {
    num_nodes: usize,
    num_classes: usize,
    max_length: usize,
    roles: Vec<NodeRole>,
    labels: Vec<Option<u32>>,
    adjacency: Adjacency,
    input_ids: Tensor,
    attention_mask: Tensor,
    device: Device,
}

impl GraphStore {
    /// Validate the parts, normalize the adjacency and move everything to `device`.
    ///
    /// # Errors
    ///
    /// Any inconsistency between roles, labels, token rows and edges is a
    /// configuration error.
    pub fn new(parts: GraphParts, device: &Device) -> TrainResult<Self> {
        let GraphParts {
            num_classes,
            max_length,
            roles,
            labels,
            edges,
            mut input_ids,
            mut attention_mask,
        } = parts;
        let num_nodes = roles.len();

        if num_nodes == 0 {
            return Err(TrainError::Config("graph has no nodes".into()));
        }
        if num_classes == 0 {
            return Err(TrainError::Config("graph needs at least one class".into()));
        }
        if max_length == 0 {
            return Err(TrainError::Config("max_length must be positive".into()));
        }
        if labels.len() != num_nodes {
            return Err(TrainError::ShapeMismatch {
                what: "labels",
                expected: num_nodes,
                actual: labels.len(),
            });
        }
        if input_ids.len() != num_nodes * max_length {
            return Err(TrainError::ShapeMismatch {
                what: "input_ids",
                expected: num_nodes * max_length,
                actual: input_ids.len(),
            });
        }
        if attention_mask.len() != num_nodes * max_length {
            return Err(TrainError::ShapeMismatch {
                what: "attention_mask",
                expected: num_nodes * max_length,
                actual: attention_mask.len(),
            });
        }

        for (node, (role, label)) in roles.iter().zip(&labels).enumerate() {
            match (role, label) {
                (NodeRole::Content(_), Some(class)) if (*class as usize) < num_classes => {}
                (NodeRole::Content(_), Some(class)) => {
                    return Err(TrainError::Config(format!(
                        "node {} has label {} but the graph has {} classes",
                        node, class, num_classes
                    )))
                }
                (NodeRole::Content(_), None) => {
                    return Err(TrainError::Config(format!(
                        "document node {} has no label",
                        node
                    )))
                }
                (NodeRole::Structural, Some(_)) => {
                    return Err(TrainError::Config(format!(
                        "structural node {} must not carry a label",
                        node
                    )))
                }
                (NodeRole::Structural, None) => {
                    let row = node * max_length..(node + 1) * max_length;
                    input_ids[row.clone()].fill(0);
                    attention_mask[row].fill(0.0);
                }
            }
        }

        for edge in &edges {
            for index in [edge.src, edge.dst] {
                if index >= num_nodes {
                    return Err(TrainError::IndexOutOfRange { index, num_nodes });
                }
            }
            if !edge.weight.is_finite() {
                return Err(TrainError::Config(format!(
                    "edge {} -> {} has non-finite weight",
                    edge.src, edge.dst
                )));
            }
        }

        let normalized = normalize_with_self_loops(&edges, num_nodes);
        let adjacency = Adjacency::from_edges(&normalized, num_nodes, device)?;

        Ok(Self {
            num_nodes,
            num_classes,
            max_length,
            roles,
            labels,
            adjacency,
            input_ids: Tensor::from_vec(input_ids, (num_nodes, max_length), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (num_nodes, max_length), device)?,
            device: device.clone(),
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn adjacency(&self) -> &Adjacency {
        &self.adjacency
    }

    pub fn role(&self, node: usize) -> TrainResult<NodeRole> {
        self.roles
            .get(node)
            .copied()
            .ok_or(TrainError::IndexOutOfRange {
                index: node,
                num_nodes: self.num_nodes,
            })
    }

    /// Token ids of the queried nodes, `u32` of shape `[Q, max_length]`.
    pub fn input_ids(&self, query: &QuerySet) -> TrainResult<Tensor> {
        Ok(self.input_ids.index_select(query.indices(), 0)?)
    }

    /// Attention mask of the queried nodes, `f32` of shape `[Q, max_length]`.
    pub fn attention_mask(&self, query: &QuerySet) -> TrainResult<Tensor> {
        Ok(self.attention_mask.index_select(query.indices(), 0)?)
    }

    /// Class indices of the given nodes. Structural nodes have none.
    pub fn labels(&self, nodes: &[usize]) -> TrainResult<Vec<u32>> {
        nodes
            .iter()
            .map(|&node| {
                let label = self.labels.get(node).ok_or(TrainError::IndexOutOfRange {
                    index: node,
                    num_nodes: self.num_nodes,
                })?;
                label.ok_or_else(|| {
                    TrainError::InvalidQuery(format!("node {} is structural and has no label", node))
                })
            })
            .collect()
    }

    /// Whether each given node belongs to the training split.
    pub fn train_flags(&self, nodes: &[usize]) -> TrainResult<Vec<bool>> {
        nodes
            .iter()
            .map(|&node| Ok(self.role(node)?.split() == Some(Split::Train)))
            .collect()
    }

    /// All document nodes, in node order.
    pub fn content_indices(&self) -> Vec<usize> {
        self.indices_where(|role| role.is_content())
    }

    /// Nodes of one split, in node order.
    pub fn split_indices(&self, split: Split) -> Vec<usize> {
        self.indices_where(|role| role.split() == Some(split))
    }

    pub fn structural_indices(&self) -> Vec<usize> {
        self.indices_where(|role| !role.is_content())
    }

    fn indices_where(&self, predicate: impl Fn(&NodeRole) -> bool) -> Vec<usize> {
        self.roles
            .iter()
            .enumerate()
            .filter(|(_, role)| predicate(role))
            .map(|(node, _)| node)
            .collect()
    }

    pub fn split_counts(&self) -> SplitCounts {
        let mut counts = SplitCounts::default();
        for role in &self.roles {
            match role {
                NodeRole::Content(Split::Train) => counts.train += 1,
                NodeRole::Content(Split::Validation) => counts.validation += 1,
                NodeRole::Content(Split::Test) => counts.test += 1,
                NodeRole::Structural => counts.structural += 1,
            }
        }
        counts
    }
}

impl std::fmt::Display for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = self.split_counts();
        write!(
            f,
            "Graph(num_nodes={}, num_edges={}, num_classes={}, train={}, val={}, test={}, structural={}, max_length={})",
            self.num_nodes,
            self.adjacency.num_edges(),
            self.num_classes,
            counts.train,
            counts.validation,
            counts.test,
            counts.structural,
            self.max_length
        )
    }
}
