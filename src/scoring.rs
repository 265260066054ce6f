use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

const HIDDEN: usize = 16;

/// Fuses the similarity signals into one relevance probability.
pub struct ScoringHead {
    hidden: Linear,
    relevance: Linear,
}

impl ScoringHead {
    pub fn new(n_signals: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            hidden: linear(n_signals, HIDDEN, vb.pp("hidden"))?,
            relevance: linear(HIDDEN, 1, vb.pp("relevance"))?,
        })
    }
}

impl Module for ScoringHead {
    /// `(batch, n_signals)` similarities to `(batch, 1)` scores in (0, 1).
    fn forward(&self, sims: &Tensor) -> Result<Tensor> {
        let xs = sims.apply(&self.hidden)?.relu()?;
        candle_nn::ops::sigmoid(&xs.apply(&self.relevance)?)
    }
}

/// Contrastive loss from Hadsell, Chopra & LeCun (2006).
///
/// mean((1 - y) * p^2 + y * max(margin - p, 0)^2)
pub fn contrastive_loss(y_true: &Tensor, y_pred: &Tensor, margin: f64) -> Result<Tensor> {
    let negative = y_true.affine(-1.0, 1.0)?.mul(&y_pred.sqr()?)?;
    let shortfall = y_pred.affine(-1.0, margin)?.relu()?.sqr()?;
    let positive = y_true.mul(&shortfall)?;
    (negative + positive)?.mean_all()
}

/// Fraction of rows where the thresholded score matches the label.
pub fn binary_accuracy(y_true: &Tensor, y_pred: &Tensor) -> Result<f32> {
    let labels = y_true.flatten_all()?.to_vec1::<f32>()?;
    let scores = y_pred.flatten_all()?.to_vec1::<f32>()?;
    if labels.is_empty() {
        return Ok(0.0);
    }
    let hits = labels
        .iter()
        .zip(scores.iter())
        .filter(|(y, p)| (**p > 0.5) == (**y > 0.5))
        .count();
    Ok(hits as f32 / labels.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn column(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (values.len(), 1), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_contrastive_loss_values() {
        // y=1,p=1 -> 0 ; y=0,p=0.5 -> 0.25 ; y=1,p=0.25 -> 0.5625 ; y=0,p=0 -> 0
        let y = column(&[1.0, 0.0, 1.0, 0.0]);
        let p = column(&[1.0, 0.5, 0.25, 0.0]);
        let loss = contrastive_loss(&y, &p, 1.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_abs_diff_eq!(loss, (0.25 + 0.5625) / 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_contrastive_loss_ignores_positive_past_margin() {
        let y = column(&[1.0]);
        let p = column(&[1.5]);
        let loss = contrastive_loss(&y, &p, 1.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_abs_diff_eq!(loss, 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_binary_accuracy() {
        let y = column(&[1.0, 0.0, 1.0, 0.0]);
        let p = column(&[0.9, 0.2, 0.4, 0.7]);
        assert_abs_diff_eq!(binary_accuracy(&y, &p).unwrap(), 0.5);
    }

    #[test]
    fn test_head_output_is_probability() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ScoringHead::new(11, vb).unwrap();
        let sims = Tensor::randn(0f32, 1.0, (5, 11), &Device::Cpu).unwrap();
        let scores = head.forward(&sims).unwrap();
        assert_eq!(scores.dims(), &[5, 1]);
        for s in scores.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(s > 0.0 && s < 1.0);
        }
    }
}
