use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info};

use crate::error::{TrainError, TrainResult};
use crate::graph::{EmbeddingCache, GraphStore, QuerySet};
use crate::model::{HybridModel, Mode};

/// What a refresh did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    pub rows: usize,
    pub batches: usize,
}

/// Re-encode every document node and overwrite its cache row.
///
/// Runs the encoder in eval mode over chunks of `batch_size` documents. The
/// encoded rows are detached before they reach the cache, and structural rows
/// are never written.
pub fn refresh_cache(
    model: &HybridModel,
    graph: &GraphStore,
    cache: &mut EmbeddingCache,
    batch_size: usize,
) -> TrainResult<RefreshStats> {
    if batch_size == 0 {
        return Err(TrainError::Config("refresh_batch_size must be positive".into()));
    }
    let content = graph.content_indices();
    if content.is_empty() {
        debug!("No document nodes, skipping cache refresh");
        return Ok(RefreshStats {
            rows: 0,
            batches: 0,
        });
    }

    let start = Instant::now();
    let mut chunks = Vec::with_capacity(content.len().div_ceil(batch_size));
    for chunk in content.chunks(batch_size) {
        let query = QuerySet::new(chunk.to_vec(), graph)?;
        chunks.push(model.encode(graph, &query, Mode::Eval)?.detach());
    }
    let batches = chunks.len();
    let rows = Tensor::cat(&chunks, 0)?;
    drop(chunks);

    let content = QuerySet::new(content, graph)?;
    cache.overwrite(&content, &rows)?;

    info!(
        rows = content.len(),
        batches,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Refreshed embedding cache"
    );
    Ok(RefreshStats {
        rows: content.len(),
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{toy_graph, toy_model};

    #[test]
    fn test_refresh_fills_documents_only() {
        let graph = toy_graph();
        let model = toy_model(&graph);
        let mut cache =
            EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device()).unwrap();
        let stats = refresh_cache(&model, &graph, &mut cache, 3).unwrap();
        assert_eq!(stats, RefreshStats { rows: 4, batches: 2 });

        let rows: Vec<Vec<f32>> = cache.committed().to_vec2().unwrap();
        for node in graph.content_indices() {
            assert!(rows[node].iter().any(|&x| x != 0.0), "document {} is zero", node);
        }
        for node in graph.structural_indices() {
            assert!(rows[node].iter().all(|&x| x == 0.0), "word {} was written", node);
        }
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let graph = toy_graph();
        let model = toy_model(&graph);
        let mut cache =
            EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device()).unwrap();
        refresh_cache(&model, &graph, &mut cache, 1024).unwrap();
        let first: Vec<Vec<f32>> = cache.committed().to_vec2().unwrap();
        refresh_cache(&model, &graph, &mut cache, 1024).unwrap();
        let second: Vec<Vec<f32>> = cache.committed().to_vec2().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let graph = toy_graph();
        let model = toy_model(&graph);
        let mut cache =
            EmbeddingCache::zeros(graph.num_nodes(), model.feature_dim(), graph.device()).unwrap();
        assert!(refresh_cache(&model, &graph, &mut cache, 0).is_err());
    }
}
