use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, linear, BatchNorm, BatchNormConfig, Dropout, Linear, VarBuilder};

use crate::config::QaMemnetConfig;

/// Shared dense block that conditions the context representation on the
/// reply representation.
pub struct MergeHead {
    norm: BatchNorm,
    dropout: Dropout,
    layers: Vec<Linear>,
}

impl MergeHead {
    pub fn new(config: &QaMemnetConfig, vb: VarBuilder) -> Result<Self> {
        let dense_dim = config.dense_dim();
        let norm_config = BatchNormConfig {
            eps: 1e-3,
            remove_mean: true,
            affine: true,
            momentum: 0.01,
        };
        let norm = batch_norm(2 * dense_dim, norm_config, vb.pp("norm"))?;

        let mut layers = Vec::with_capacity(config.merge_layers);
        let mut in_dim = 2 * dense_dim;
        for li in 0..config.merge_layers {
            layers.push(linear(in_dim, dense_dim, vb.pp(format!("dense{li}")))?);
            in_dim = dense_dim;
        }

        Ok(Self {
            norm,
            dropout: Dropout::new(config.dropout),
            layers,
        })
    }

    /// Output width equals the input representation width when at least one
    /// dense layer is present.
    pub fn forward(&self, ctx: &Tensor, rpl: &Tensor, train: bool) -> Result<Tensor> {
        let xs = Tensor::cat(&[ctx, rpl], 1)?;
        let xs = xs.apply_t(&self.norm, train)?;
        let mut xs = self.dropout.forward(&xs, train)?;
        for layer in &self.layers {
            xs = xs.apply(layer)?.relu()?;
        }
        Ok(xs)
    }
}
