//! Convex blend of the encoder head and the propagated prediction.

use candle_core::Tensor;
use candle_nn::ops::softmax_last_dim;

use crate::error::{TrainError, TrainResult};

/// Keeps the log finite when both predictions put zero mass on a class.
const LOG_EPSILON: f64 = 1e-10;

/// `m * p_head + (1 - m) * p_graph`, returned as log-probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvexMix {
    m: f64,
}

impl ConvexMix {
    pub fn new(m: f64) -> TrainResult<Self> {
        if !(0.0..=1.0).contains(&m) {
            return Err(TrainError::Config(format!(
                "mix coefficient m must be within [0, 1], got {}",
                m
            )));
        }
        Ok(Self { m })
    }

    pub fn m(&self) -> f64 {
        self.m
    }

    /// Blend `[Q, C]` head logits with `[Q, C]` propagated logits.
    pub fn log_probs(&self, head_logits: &Tensor, graph_logits: &Tensor) -> TrainResult<Tensor> {
        let head = softmax_last_dim(head_logits)?;
        let graph = softmax_last_dim(graph_logits)?;
        let mixed = (head.affine(self.m, 0.0)? + graph.affine(1.0 - self.m, 0.0)?)?;
        Ok(mixed.affine(1.0, LOG_EPSILON)?.log()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_rejects_out_of_range() {
        assert!(ConvexMix::new(-0.1).is_err());
        assert!(ConvexMix::new(1.5).is_err());
        assert!(ConvexMix::new(0.0).is_ok());
        assert!(ConvexMix::new(1.0).is_ok());
    }

    #[test]
    fn test_endpoints_select_one_side() {
        let head = Tensor::new(&[[2f32, 0.0]], &Device::Cpu).unwrap();
        let graph = Tensor::new(&[[0f32, 2.0]], &Device::Cpu).unwrap();

        let all_head: Vec<Vec<f32>> = ConvexMix::new(1.0)
            .unwrap()
            .log_probs(&head, &graph)
            .unwrap()
            .to_vec2()
            .unwrap();
        let all_graph: Vec<Vec<f32>> = ConvexMix::new(0.0)
            .unwrap()
            .log_probs(&head, &graph)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!(all_head[0][0] > all_head[0][1]);
        assert!(all_graph[0][1] > all_graph[0][0]);
    }

    #[test]
    fn test_output_is_a_distribution() {
        let head = Tensor::new(&[[1f32, -1.0, 0.5]], &Device::Cpu).unwrap();
        let graph = Tensor::new(&[[0f32, 3.0, -2.0]], &Device::Cpu).unwrap();
        let log_probs = ConvexMix::new(0.3).unwrap().log_probs(&head, &graph).unwrap();
        let total: f32 = log_probs.exp().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!((total - 1.0).abs() < 1e-4);
    }
}
