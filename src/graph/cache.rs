//! Staleness-managed embedding cache.
//!
//! One `[N, D]` row per node holding the most recent encoder output for that
//! node. The cache separates two kinds of state:
//!
//! - **committed**: the snapshot every propagation pass reads. It is always
//!   detached from any gradient graph and is only replaced wholesale.
//! - **pending**: fresh rows produced by an in-flight training step
//!   ([`PendingRows`]). They become visible only through [`EmbeddingCache::commit`],
//!   which the scheduler calls after the optimizer step.
//!
//! During a step the propagation input is built with [`EmbeddingCache::overlay`],
//! which carries gradient through the fresh sub-block only. Rows outside the
//! query set are selected from the committed snapshot with `where_cond`, so they
//! are bit-identical before and after a step.

use candle_core::{DType, Device, Tensor};

use super::query::QuerySet;
use crate::error::{TrainError, TrainResult};

/// Fresh rows staged by a training step, detached and waiting to be committed.
#[derive(Debug)]
pub struct PendingRows {
    query: QuerySet,
    rows: Tensor,
}

impl PendingRows {
    pub fn nodes(&self) -> &[usize] {
        self.query.nodes()
    }
}

/// Per-node embedding cache. See the module docs for the commit protocol.
#[derive(Debug)]
pub struct EmbeddingCache {
    committed: Tensor,
    num_nodes: usize,
    dim: usize,
}

impl EmbeddingCache {
    /// A zero-initialized cache of shape `[num_nodes, dim]`.
    pub fn zeros(num_nodes: usize, dim: usize, device: &Device) -> TrainResult<Self> {
        if num_nodes == 0 || dim == 0 {
            return Err(TrainError::Config(format!(
                "cache shape [{}, {}] must be non-empty",
                num_nodes, dim
            )));
        }
        Ok(Self {
            committed: Tensor::zeros((num_nodes, dim), DType::F32, device)?,
            num_nodes,
            dim,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The committed snapshot, `[N, D]`, never attached to a gradient graph.
    pub fn committed(&self) -> &Tensor {
        &self.committed
    }

    /// Committed rows of the queried nodes, `[Q, D]`.
    pub fn rows(&self, query: &QuerySet) -> TrainResult<Tensor> {
        Ok(self.committed.index_select(query.indices(), 0)?)
    }

    /// The committed snapshot with the queried rows replaced by `fresh`.
    ///
    /// Differentiable with respect to `fresh` only.
    pub fn overlay(&self, query: &QuerySet, fresh: &Tensor) -> TrainResult<Tensor> {
        self.check_rows(query, fresh)?;
        let scattered = Tensor::zeros((self.num_nodes, self.dim), DType::F32, fresh.device())?
            .index_add(query.indices(), &fresh.contiguous()?, 0)?;
        Ok(query
            .row_mask_for(self.dim)?
            .where_cond(&scattered, &self.committed)?)
    }

    /// Stage fresh rows for a later commit. The rows are detached here.
    pub fn stage(&self, query: &QuerySet, fresh: &Tensor) -> TrainResult<PendingRows> {
        self.check_rows(query, fresh)?;
        Ok(PendingRows {
            query: query.clone(),
            rows: fresh.detach(),
        })
    }

    /// Swap the pending rows into the committed snapshot.
    pub fn commit(&mut self, pending: PendingRows) -> TrainResult<()> {
        self.committed = self.overlay(&pending.query, &pending.rows)?.detach();
        Ok(())
    }

    /// Replace the rows of `content` with `rows`, leaving every other row as is.
    ///
    /// Used by the cache refresh; `rows` is detached before it is stored.
    pub fn overwrite(&mut self, content: &QuerySet, rows: &Tensor) -> TrainResult<()> {
        let staged = self.stage(content, rows)?;
        self.commit(staged)
    }

    fn check_rows(&self, query: &QuerySet, fresh: &Tensor) -> TrainResult<()> {
        let (count, dim) = fresh.dims2()?;
        if count != query.len() {
            return Err(TrainError::ShapeMismatch {
                what: "fresh cache rows",
                expected: query.len(),
                actual: count,
            });
        }
        if dim != self.dim {
            return Err(TrainError::ShapeMismatch {
                what: "cache row width",
                expected: self.dim,
                actual: dim,
            });
        }
        let (mask_rows, _) = query.row_mask().dims2()?;
        if mask_rows != self.num_nodes {
            return Err(TrainError::ShapeMismatch {
                what: "query row mask",
                expected: self.num_nodes,
                actual: mask_rows,
            });
        }
        Ok(())
    }
}
