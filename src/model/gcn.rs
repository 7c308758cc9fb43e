//! Graph convolution over normalized edge weights.
//!
//! Each layer computes `H' = Â (H W) + b` where `Â` is the normalized
//! adjacency. Hidden layers use ELU, and dropout is applied to the input of
//! every layer except the first.

use candle_core::Tensor;
use candle_nn::{Dropout, Init, VarBuilder};

use super::propagation::{xavier_bound, PropagationKind, PropagationLayer};
use super::Mode;
use crate::error::{TrainError, TrainResult};
use crate::graph::Adjacency;

struct GraphConv {
    weight: Tensor,
    bias: Tensor,
}

impl GraphConv {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> TrainResult<Self> {
        let bound = xavier_bound(in_dim, out_dim);
        Ok(Self {
            weight: vb.get_with_hints(
                (in_dim, out_dim),
                "weight",
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                },
            )?,
            bias: vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?,
        })
    }

    fn forward(&self, adjacency: &Adjacency, h: &Tensor) -> TrainResult<Tensor> {
        let projected = h.matmul(&self.weight)?;
        let messages = projected
            .index_select(adjacency.src(), 0)?
            .broadcast_mul(&adjacency.weight().unsqueeze(1)?)?;
        Ok(adjacency
            .scatter_to_dst(&messages)?
            .broadcast_add(&self.bias)?)
    }
}

/// Multi-layer GCN.
pub struct GcnPropagation {
    layers: Vec<GraphConv>,
    dropout: Dropout,
}

impl GcnPropagation {
    pub fn new(
        in_dim: usize,
        hidden_dim: usize,
        num_classes: usize,
        num_layers: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> TrainResult<Self> {
        if num_layers == 0 {
            return Err(TrainError::Config("gcn needs at least one layer".into()));
        }
        let mut dims = vec![in_dim];
        dims.extend(std::iter::repeat(hidden_dim).take(num_layers - 1));
        dims.push(num_classes);

        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| GraphConv::new(pair[0], pair[1], vb.pp(format!("layers.{}", i))))
            .collect::<TrainResult<Vec<_>>>()?;

        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl PropagationLayer for GcnPropagation {
    fn propagate(&self, adjacency: &Adjacency, rows: &Tensor, mode: Mode) -> TrainResult<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = rows.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            if i != 0 {
                h = self.dropout.forward(&h, mode.is_train())?;
            }
            h = layer.forward(adjacency, &h)?;
            if i != last {
                h = h.elu(1.0)?;
            }
        }
        Ok(h)
    }

    fn kind(&self) -> PropagationKind {
        PropagationKind::Gcn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::toy_graph;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_layer_dims() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gcn = GcnPropagation::new(8, 4, 2, 3, 0.5, vb).unwrap();
        assert_eq!(gcn.num_layers(), 3);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"layers.2.weight".to_string()));
    }

    #[test]
    fn test_output_covers_every_node() {
        let graph = toy_graph();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, graph.device());
        let gcn = GcnPropagation::new(5, 4, 2, 2, 0.0, vb).unwrap();
        let rows = Tensor::randn(0f32, 1f32, (graph.num_nodes(), 5), graph.device()).unwrap();
        let logits = gcn.propagate(graph.adjacency(), &rows, Mode::Eval).unwrap();
        assert_eq!(logits.dims(), &[graph.num_nodes(), 2]);
    }

    #[test]
    fn test_single_layer_is_weighted_neighbourhood_sum() {
        let graph = toy_graph();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, graph.device());
        let gcn = GcnPropagation::new(1, 1, 1, 1, 0.0, vb).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("layers.0.weight")
            .unwrap()
            .set(&Tensor::ones((1, 1), DType::F32, graph.device()).unwrap())
            .unwrap();

        // With W = 1 and b = 0, ones in → row sums of the normalized adjacency out
        let rows = Tensor::ones((graph.num_nodes(), 1), DType::F32, graph.device()).unwrap();
        let out: Vec<Vec<f32>> = gcn
            .propagate(graph.adjacency(), &rows, Mode::Eval)
            .unwrap()
            .to_vec2()
            .unwrap();
        let weights = graph.adjacency().weight().to_vec1::<f32>().unwrap();
        let dst = graph.adjacency().dst().to_vec1::<u32>().unwrap();
        let mut expected = vec![0f32; graph.num_nodes()];
        for (w, d) in weights.iter().zip(&dst) {
            expected[*d as usize] += w;
        }
        for (node, row) in out.iter().enumerate() {
            assert!((row[0] - expected[node]).abs() < 1e-5);
        }
    }
}
