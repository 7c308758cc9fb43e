//! Graph propagation capability.
//!
//! A propagation layer does two things: decide what row each node feeds into
//! the graph pass ([`PropagationLayer::combine`]), and run the pass over the
//! whole graph ([`PropagationLayer::propagate`]). GCN and GAT variants are
//! interchangeable behind this trait.

use std::str::FromStr;

use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use super::gat::GatPropagation;
use super::gcn::GcnPropagation;
use super::Mode;
use crate::error::{TrainError, TrainResult};
use crate::graph::{Adjacency, EmbeddingCache, QuerySet};
use crate::ModelConfig;

/// A graph-propagation model over the fixed adjacency.
pub trait PropagationLayer: Send + Sync {
    /// Propagation input for every node: fresh rows for the query set,
    /// committed cache rows for everyone else.
    fn combine(
        &self,
        cache: &EmbeddingCache,
        query: &QuerySet,
        fresh: &Tensor,
    ) -> TrainResult<Tensor> {
        cache.overlay(query, fresh)
    }

    /// Class logits `[N, C]` for every node from input rows `[N, D]`.
    fn propagate(&self, adjacency: &Adjacency, rows: &Tensor, mode: Mode) -> TrainResult<Tensor>;

    fn kind(&self) -> PropagationKind;
}

/// Which propagation variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropagationKind {
    #[default]
    Gcn,
    Gat,
}

impl std::fmt::Display for PropagationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gcn => write!(f, "gcn"),
            Self::Gat => write!(f, "gat"),
        }
    }
}

impl FromStr for PropagationKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gcn" => Ok(Self::Gcn),
            "gat" => Ok(Self::Gat),
            other => Err(TrainError::Config(format!(
                "unknown propagation '{}', expected gcn or gat",
                other
            ))),
        }
    }
}

/// Build the configured propagation layer from `feature_dim` inputs to `num_classes` outputs.
pub fn build_propagation(
    config: &ModelConfig,
    num_classes: usize,
    vb: VarBuilder,
) -> TrainResult<Box<dyn PropagationLayer>> {
    Ok(match config.propagation {
        PropagationKind::Gcn => Box::new(GcnPropagation::new(
            config.feature_dim,
            config.hidden_dim,
            num_classes,
            config.layers,
            config.dropout,
            vb,
        )?),
        PropagationKind::Gat => Box::new(GatPropagation::new(
            config.feature_dim,
            config.hidden_dim,
            num_classes,
            config.layers,
            config.heads,
            config.dropout,
            vb,
        )?),
    })
}

/// Glorot-uniform bound for a `[fan_in, fan_out]` weight.
pub(crate) fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}
