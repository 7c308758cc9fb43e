//! Text encoder.
//!
//! The rest of the crate only relies on [`TextEncoder`]: token ids and an
//! attention mask in, one dense row per document out. [`PooledTextEncoder`] is
//! the built-in implementation: learned token and position embeddings, masked
//! mean pooling and a tanh pooler.

use candle_core::{DType, Module, Tensor};
use candle_nn::{embedding, linear, Dropout, Embedding, Linear, VarBuilder};

use super::Mode;
use crate::error::{TrainError, TrainResult};

/// Maps tokenized documents to dense feature rows.
pub trait TextEncoder: Send + Sync {
    /// Width of the produced rows; the embedding cache is sized from it.
    fn output_dim(&self) -> usize;

    /// Encode `[B, L]` token ids with a `[B, L]` attention mask into `[B, output_dim]`.
    fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, mode: Mode)
        -> TrainResult<Tensor>;
}

/// Mean-pooled embedding encoder.
pub struct PooledTextEncoder {
    token_embeddings: Embedding,
    position_embeddings: Embedding,
    pooler: Linear,
    dropout: Dropout,
    max_length: usize,
    dim: usize,
}

impl PooledTextEncoder {
    pub fn new(
        vocab_size: usize,
        max_length: usize,
        dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> TrainResult<Self> {
        if vocab_size == 0 || max_length == 0 || dim == 0 {
            return Err(TrainError::Config(format!(
                "encoder needs positive sizes (vocab={}, max_length={}, dim={})",
                vocab_size, max_length, dim
            )));
        }
        Ok(Self {
            token_embeddings: embedding(vocab_size, dim, vb.pp("token_embeddings"))?,
            position_embeddings: embedding(max_length, dim, vb.pp("position_embeddings"))?,
            pooler: linear(dim, dim, vb.pp("pooler"))?,
            dropout: Dropout::new(dropout),
            max_length,
            dim,
        })
    }
}

impl TextEncoder for PooledTextEncoder {
    fn output_dim(&self) -> usize {
        self.dim
    }

    fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        mode: Mode,
    ) -> TrainResult<Tensor> {
        let (_, len) = input_ids.dims2()?;
        if len > self.max_length {
            return Err(TrainError::ShapeMismatch {
                what: "token sequence length",
                expected: self.max_length,
                actual: len,
            });
        }

        let positions = Tensor::arange(0u32, len as u32, input_ids.device())?;
        let hidden = self
            .token_embeddings
            .forward(input_ids)?
            .broadcast_add(&self.position_embeddings.forward(&positions)?)?;
        let hidden = self.dropout.forward(&hidden, mode.is_train())?;

        // Masked mean over the sequence; an all-padding row pools to zero
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.maximum(1f64)?;
        let pooled = summed.broadcast_div(&counts)?;

        Ok(self.pooler.forward(&pooled)?.tanh()?)
    }
}
