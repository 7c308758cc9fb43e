use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder};
use tracing::debug;

use super::encoder::{PooledTextEncoder, TextEncoder};
use super::mix::ConvexMix;
use super::propagation::{build_propagation, PropagationLayer};
use super::{Component, Mode, ModelParams};
use crate::error::{TrainError, TrainResult};
use crate::graph::{EmbeddingCache, GraphStore, QuerySet};
use crate::ModelConfig;

/// Output of a forward pass over a query set.
#[derive(Debug)]
pub struct Prediction {
    /// Blended log-probabilities, `[Q, C]`.
    pub log_probs: Tensor,
    /// Fresh encoder rows for the query set, `[Q, D]`. Only produced in
    /// [`Mode::Train`]; eval reads the committed cache instead.
    pub fresh: Option<Tensor>,
}

/// Text encoder, classifier head and propagation layer wired together.
pub struct HybridModel {
    params: ModelParams,
    encoder: Box<dyn TextEncoder>,
    classifier: Linear,
    propagation: Box<dyn PropagationLayer>,
    mix: ConvexMix,
    num_classes: usize,
}

impl HybridModel {
    pub fn new(
        config: &ModelConfig,
        vocab_size: usize,
        max_length: usize,
        num_classes: usize,
        device: &Device,
    ) -> TrainResult<Self> {
        let params = ModelParams::new();
        let vb = |component| VarBuilder::from_varmap(params.varmap(component), DType::F32, device);

        let encoder = PooledTextEncoder::new(
            vocab_size,
            max_length,
            config.feature_dim,
            config.encoder_dropout,
            vb(Component::Encoder),
        )?;
        let classifier = linear(config.feature_dim, num_classes, vb(Component::Classifier))?;
        let propagation = build_propagation(config, num_classes, vb(Component::Propagation))?;
        let mix = ConvexMix::new(config.m)?;

        let model = Self {
            encoder: Box::new(encoder),
            classifier,
            propagation,
            mix,
            num_classes,
            params,
        };
        debug!(
            propagation = %model.propagation.kind(),
            m = config.m,
            parameters = model.params.parameter_count()?,
            "Built hybrid model"
        );
        Ok(model)
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn feature_dim(&self) -> usize {
        self.encoder.output_dim()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Encode the documents of `query` into `[Q, D]` rows.
    pub fn encode(&self, graph: &GraphStore, query: &QuerySet, mode: Mode) -> TrainResult<Tensor> {
        let ids = graph.input_ids(query)?;
        let mask = graph.attention_mask(query)?;
        self.encoder.encode(&ids, &mask, mode)
    }

    /// Predict class log-probabilities for `query`.
    ///
    /// In train mode the query set is re-encoded and its fresh rows replace
    /// the committed cache rows inside the propagation input. In eval mode the
    /// committed cache is used as is.
    pub fn predict(
        &self,
        graph: &GraphStore,
        cache: &EmbeddingCache,
        query: &QuerySet,
        mode: Mode,
    ) -> TrainResult<Prediction> {
        if cache.num_nodes() != graph.num_nodes() || cache.dim() != self.feature_dim() {
            return Err(TrainError::ShapeMismatch {
                what: "embedding cache",
                expected: graph.num_nodes() * self.feature_dim(),
                actual: cache.num_nodes() * cache.dim(),
            });
        }

        let (features, rows, fresh) = match mode {
            Mode::Train => {
                let fresh = self.encode(graph, query, mode)?;
                let rows = self.propagation.combine(cache, query, &fresh)?;
                (fresh.clone(), rows, Some(fresh))
            }
            Mode::Eval => (cache.rows(query)?, cache.committed().clone(), None),
        };

        let head_logits = self.classifier.forward(&features)?;
        let graph_logits = self
            .propagation
            .propagate(graph.adjacency(), &rows, mode)?
            .index_select(query.indices(), 0)?;
        let log_probs = self.mix.log_probs(&head_logits, &graph_logits)?;

        Ok(Prediction { log_probs, fresh })
    }

    /// Propagated logits `[N, C]` for every node from the committed cache.
    pub fn propagate_all(&self, graph: &GraphStore, cache: &EmbeddingCache) -> TrainResult<Tensor> {
        self.propagation
            .propagate(graph.adjacency(), cache.committed(), Mode::Eval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{toy_graph, toy_model_config};

    fn toy_model() -> (GraphStore, HybridModel) {
        let graph = toy_graph();
        let config = toy_model_config();
        let model =
            HybridModel::new(&config, 32, graph.max_length(), graph.num_classes(), graph.device())
                .unwrap();
        (graph, model)
    }

    #[test]
    fn test_parameters_are_grouped() {
        let (_, model) = toy_model();
        for component in Component::ALL {
            assert!(
                !model.params().named_vars(component).unwrap().is_empty(),
                "{:?} has no parameters",
                component
            );
        }
        let classifier = model.params().named_tensors(Component::Classifier).unwrap();
        let names: Vec<&str> = classifier.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["classifier.bias", "classifier.weight"]);
    }

    #[test]
    fn test_train_prediction_returns_fresh_rows() {
        let (graph, model) = toy_model();
        let cache = EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device())
            .unwrap();
        let query = QuerySet::new(vec![0, 1], &graph).unwrap();
        let prediction = model.predict(&graph, &cache, &query, Mode::Train).unwrap();
        assert_eq!(prediction.log_probs.dims(), &[2, graph.num_classes()]);
        assert_eq!(
            prediction.fresh.unwrap().dims(),
            &[2, model.feature_dim()]
        );
    }

    #[test]
    fn test_eval_prediction_reads_cache() {
        let (graph, model) = toy_model();
        let cache = EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device())
            .unwrap();
        let query = QuerySet::new(vec![2, 5], &graph).unwrap();
        let a = model.predict(&graph, &cache, &query, Mode::Eval).unwrap();
        let b = model.predict(&graph, &cache, &query, Mode::Eval).unwrap();
        assert!(a.fresh.is_none());
        let a: Vec<Vec<f32>> = a.log_probs.to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.log_probs.to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_mismatched_cache() {
        let (graph, model) = toy_model();
        let cache = EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim() + 1, graph.device())
            .unwrap();
        let query = QuerySet::new(vec![0], &graph).unwrap();
        assert!(model.predict(&graph, &cache, &query, Mode::Eval).is_err());
    }
}
