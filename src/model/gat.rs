//! Graph attention over the same adjacency the GCN uses.
//!
//! Attention scores are computed per head on every edge (self-loops included),
//! normalized with a softmax over each destination's incoming edges, and used
//! to weight the projected source features. Hidden layers concatenate their
//! heads and apply ELU; the output layer has a single head.

use candle_core::{Tensor, D};
use candle_nn::{Dropout, Init, VarBuilder};

use super::propagation::{xavier_bound, PropagationKind, PropagationLayer};
use super::Mode;
use crate::error::{TrainError, TrainResult};
use crate::graph::Adjacency;

const NEGATIVE_SLOPE: f64 = 0.2;

struct GatConv {
    fc: Tensor,
    attn_src: Tensor,
    attn_dst: Tensor,
    bias: Tensor,
    heads: usize,
    out_dim: usize,
}

impl GatConv {
    fn new(in_dim: usize, out_dim: usize, heads: usize, vb: VarBuilder) -> TrainResult<Self> {
        let bound = xavier_bound(in_dim, heads * out_dim);
        let attn_bound = xavier_bound(heads, out_dim);
        Ok(Self {
            fc: vb.get_with_hints(
                (in_dim, heads * out_dim),
                "fc",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?,
            attn_src: vb.get_with_hints(
                (heads, out_dim),
                "attn_src",
                Init::Uniform {
                    lo: -attn_bound,
                    up: attn_bound,
                },
            )?,
            attn_dst: vb.get_with_hints(
                (heads, out_dim),
                "attn_dst",
                Init::Uniform {
                    lo: -attn_bound,
                    up: attn_bound,
                },
            )?,
            bias: vb.get_with_hints(heads * out_dim, "bias", Init::Const(0.0))?,
            heads,
            out_dim,
        })
    }

    /// `[N, in]` → `[N, heads, out]`.
    fn forward(
        &self,
        adjacency: &Adjacency,
        h: &Tensor,
        attn_drop: &Dropout,
        train: bool,
    ) -> TrainResult<Tensor> {
        let num_nodes = adjacency.num_nodes();
        let z = h
            .matmul(&self.fc)?
            .reshape((num_nodes, self.heads, self.out_dim))?;

        let score_src = z.broadcast_mul(&self.attn_src.unsqueeze(0)?)?.sum(D::Minus1)?;
        let score_dst = z.broadcast_mul(&self.attn_dst.unsqueeze(0)?)?.sum(D::Minus1)?;
        let e = (score_src.index_select(adjacency.src(), 0)?
            + score_dst.index_select(adjacency.dst(), 0)?)?;
        let e = e.maximum(&e.affine(NEGATIVE_SLOPE, 0.0)?)?;

        // Edge softmax per destination, shifted by that destination's max score
        let shift = adjacency.max_per_dst(&e)?.index_select(adjacency.dst(), 0)?;
        let exp = (e - shift)?.exp()?;
        let denom = adjacency.scatter_to_dst(&exp)?;
        let alpha = (exp / denom.index_select(adjacency.dst(), 0)?)?;
        let alpha = attn_drop.forward(&alpha, train)?;

        let messages = z
            .index_select(adjacency.src(), 0)?
            .broadcast_mul(&alpha.unsqueeze(2)?)?;
        let bias = self.bias.reshape((1, self.heads, self.out_dim))?;
        Ok(adjacency.scatter_to_dst(&messages)?.broadcast_add(&bias)?)
    }
}

/// Multi-head GAT.
pub struct GatPropagation {
    layers: Vec<GatConv>,
    dropout: Dropout,
}

impl GatPropagation {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        num_layers: usize,
        heads: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> TrainResult<Self> {
        if num_layers == 0 || heads == 0 {
            return Err(TrainError::Config(format!(
                "gat needs at least one layer and one head (layers={}, heads={})",
                num_layers, heads
            )));
        }
        let mut layers = Vec::with_capacity(num_layers);
        let mut width = in_dim;
        for i in 0..num_layers - 1 {
            layers.push(GatConv::new(width, hidden_dim, heads, vb.pp(format!("layers.{}", i)))?);
            width = hidden_dim * heads;
        }
        layers.push(GatConv::new(
            width,
            num_classes,
            1,
            vb.pp(format!("layers.{}", num_layers - 1)),
        )?);

        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
        })
    }
}

impl PropagationLayer for GatPropagation {
    fn propagate(&self, adjacency: &Adjacency, rows: &Tensor, mode: Mode) -> TrainResult<Tensor> {
        let train = mode.is_train();
        let last = self.layers.len() - 1;
        let mut h = rows.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = self.dropout.forward(&h, train)?;
            let out = layer.forward(adjacency, &h, &self.dropout, train)?;
            h = if i == last {
                out.mean(1)?
            } else {
                out.elu(1.0)?.flatten_from(1)?
            };
        }
        Ok(h)
    }

    fn kind(&self) -> PropagationKind {
        PropagationKind::Gat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphParts, GraphStore, NodeRole};
    use crate::test_helpers::toy_graph;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_output_shape() {
        let graph = toy_graph();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, graph.device());
        let gat = GatPropagation::new(5, 3, 2, 2, 4, 0.0, vb).unwrap();
        let rows = Tensor::randn(0f32, 1f32, (graph.num_nodes(), 5), graph.device()).unwrap();
        let logits = gat.propagate(graph.adjacency(), &rows, Mode::Eval).unwrap();
        assert_eq!(logits.dims(), &[graph.num_nodes(), 2]);
        let values: Vec<Vec<f32>> = logits.to_vec2().unwrap();
        assert!(values.iter().flatten().all(|x| x.is_finite()));
    }

    #[test]
    fn test_attention_sums_to_one_per_destination() {
        // With fc = I and a constant input, every message equals the input, so a
        // convex combination of them reproduces it exactly.
        let graph = toy_graph();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, graph.device());
        let gat = GatPropagation::new(2, 2, 2, 1, 1, 0.0, vb).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("layers.0.fc")
            .unwrap()
            .set(&Tensor::eye(2, DType::F32, graph.device()).unwrap())
            .unwrap();

        let rows = Tensor::full(0.75f32, (graph.num_nodes(), 2), graph.device()).unwrap();
        let out: Vec<Vec<f32>> = gat
            .propagate(graph.adjacency(), &rows, Mode::Eval)
            .unwrap()
            .to_vec2()
            .unwrap();
        for row in out {
            for x in row {
                assert!((x - 0.75).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_rejects_zero_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &candle_core::Device::Cpu);
        assert!(GatPropagation::new(4, 4, 2, 2, 0, 0.5, vb).is_err());
    }

    #[test]
    fn test_softmax_is_shifted_per_destination() {
        // Two isolated nodes whose self-loop scores are 400 apart
        let parts = GraphParts {
            num_classes: 1,
            max_length: 1,
            roles: vec![NodeRole::Structural, NodeRole::Structural],
            labels: vec![None, None],
            edges: Vec::new(),
            input_ids: vec![0, 0],
            attention_mask: vec![0.0, 0.0],
        };
        let graph = GraphStore::new(parts, &Device::Cpu).unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gat = GatPropagation::new(1, 1, 1, 1, 1, 0.0, vb).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            let set = |name: &str, value: f32| {
                data[name]
                    .set(&Tensor::full(value, (1, 1), &Device::Cpu).unwrap())
                    .unwrap();
            };
            set("layers.0.fc", 1.0);
            set("layers.0.attn_src", 1.0);
            set("layers.0.attn_dst", 0.0);
        }

        let rows = Tensor::new(&[[200f32], [-200.0]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = gat
            .propagate(graph.adjacency(), &rows, Mode::Eval)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!((out[0][0] - 200.0).abs() < 1e-3, "{:?}", out);
        assert!((out[1][0] + 200.0).abs() < 1e-3, "{:?}", out);
    }
}
