//! JSON graph description and its conversion into a [`GraphStore`].
//!
//! ```json
//! {
//!   "num_classes": 2,
//!   "nodes": [
//!     { "kind": "document", "text": "a fine film", "label": 0, "split": "train" },
//!     { "kind": "word", "term": "film" }
//!   ],
//!   "edges": [ { "src": 0, "dst": 1, "weight": 0.7 } ]
//! }
//! ```
//!
//! Nodes are kept in file order. Edges are undirected unless `directed` is
//! set, in which case they are taken as listed.

use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tokenizer::Tokenize;
use crate::error::{TrainError, TrainResult};
use crate::graph::{Edge, GraphParts, GraphStore, NodeRole, Split};

/// One node of the dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeRecord {
    Document { text: String, label: u32, split: Split },
    Word {
        #[serde(default)]
        term: Option<String>,
    },
}

impl NodeRecord {
    pub fn role(&self) -> NodeRole {
        match self {
            Self::Document { split, .. } => NodeRole::Content(*split),
            Self::Word { .. } => NodeRole::Structural,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Document { text, .. } => Some(text),
            Self::Word { .. } => None,
        }
    }
}

/// A whole dataset file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFile {
    pub num_classes: usize,
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub directed: bool,
}

impl DatasetFile {
    pub fn load(path: &Path) -> TrainResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TrainError::Dataset(format!("failed to read {}: {}", path.display(), e))
        })?;
        let dataset = Self::from_json(&content)?;
        info!(
            path = %path.display(),
            nodes = dataset.nodes.len(),
            edges = dataset.edges.len(),
            "Loaded dataset"
        );
        Ok(dataset)
    }

    pub fn from_json(content: &str) -> TrainResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| TrainError::Dataset(format!("malformed dataset: {}", e)))
    }

    /// Document texts with backslashes removed, in node order.
    pub fn documents(&self) -> impl Iterator<Item = String> + '_ {
        self.nodes
            .iter()
            .filter_map(NodeRecord::text)
            .map(clean_text)
    }

    /// Edges as the graph should see them: mirrored unless the file is directed.
    fn graph_edges(&self) -> Vec<Edge> {
        if self.directed {
            return self.edges.clone();
        }
        let mut edges = Vec::with_capacity(self.edges.len() * 2);
        for edge in &self.edges {
            edges.push(*edge);
            if edge.src != edge.dst {
                edges.push(Edge {
                    src: edge.dst,
                    dst: edge.src,
                    weight: edge.weight,
                });
            }
        }
        edges
    }
}

fn clean_text(text: &str) -> String {
    text.replace('\\', "")
}

/// Tokenize every document and assemble the graph store.
pub fn build_graph(
    dataset: &DatasetFile,
    tokenizer: &dyn Tokenize,
    max_length: usize,
    device: &Device,
) -> TrainResult<GraphStore> {
    let num_nodes = dataset.nodes.len();
    let mut input_ids = vec![0u32; num_nodes * max_length];
    let mut attention_mask = vec![0f32; num_nodes * max_length];
    let mut roles = Vec::with_capacity(num_nodes);
    let mut labels = Vec::with_capacity(num_nodes);

    for (node, record) in dataset.nodes.iter().enumerate() {
        roles.push(record.role());
        match record {
            NodeRecord::Document { text, label, .. } => {
                let encoded = tokenizer.encode(&clean_text(text), max_length)?;
                let row = node * max_length..(node + 1) * max_length;
                input_ids[row.clone()].copy_from_slice(&encoded.ids);
                attention_mask[row].copy_from_slice(&encoded.mask);
                labels.push(Some(*label));
            }
            NodeRecord::Word { .. } => labels.push(None),
        }
    }

    let graph = GraphStore::new(
        GraphParts {
            num_classes: dataset.num_classes,
            max_length,
            roles,
            labels,
            edges: dataset.graph_edges(),
            input_ids,
            attention_mask,
        },
        device,
    )?;
    debug!(%graph, "Built graph store");
    Ok(graph)
}
