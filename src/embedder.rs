use candle_core::{Result, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Init, Linear, Module, VarBuilder};

use crate::config::QaMemnetConfig;

/// Name of the lookup table inside the parameter map.
pub const EMBEDDING_WEIGHT: &str = "embedding.weight";

const LEAKY_SLOPE: f64 = 0.3;

pub struct Embedder {
    embedding: Embedding,
    transform: Option<Linear>,
    token_weights: Option<Embedding>,
}

impl Embedder {
    /// `vb` must be the root builder so the table lands at [`EMBEDDING_WEIGHT`].
    pub fn new(config: &QaMemnetConfig, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(config.vocab_size, config.emb_dim, vb.pp("embedding"))?;

        let transform = if config.transformed_embeddings {
            Some(linear(config.emb_dim, config.emb_dim, vb.pp("embedding_transform"))?)
        } else {
            None
        };

        // every token starts with the same weight
        let token_weights = if config.weighted_embeddings {
            let weights = vb.pp("token_weight").get_with_hints(
                (config.vocab_size, 1),
                "weight",
                Init::Const(1.0),
            )?;
            Some(Embedding::new(weights, 1))
        } else {
            None
        };

        Ok(Self {
            embedding,
            transform,
            token_weights,
        })
    }
}

fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    xs.maximum(&(xs * LEAKY_SLOPE)?)
}

impl Module for Embedder {
    /// `(batch, seq_len)` ids to `(batch, seq_len, emb_dim)`.
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let mut xs = self.embedding.forward(ids)?;
        if let Some(transform) = &self.transform {
            xs = leaky_relu(&xs.apply(transform)?)?;
        }
        if let Some(token_weights) = &self.token_weights {
            let raw = token_weights.forward(ids)?.squeeze(D::Minus1)?;
            let weights = candle_nn::ops::softmax(&raw, D::Minus1)?.unsqueeze(D::Minus1)?;
            xs = xs.broadcast_mul(&weights)?;
        }
        Ok(xs)
    }
}
