use candle_core::{Result, Tensor, D};

use crate::encoder::SentenceRepr;

/// Floor applied to the squared norm before normalizing.
const NORM_FLOOR: f64 = 1e-12;

/// Scale rows to unit length along the last axis. Zero rows stay zero.
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.maximum(NORM_FLOOR)?.sqrt()?;
    xs.broadcast_div(&norm)
}

/// Row-wise cosine similarity of two `(batch, dim)` tensors, shaped `(batch, 1)`.
pub fn cosine_similarity(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    let x = l2_normalize(x)?;
    let y = l2_normalize(y)?;
    (x * y)?.sum_keepdim(D::Minus1)
}

/// Similarities available before conditioning: full against full, then
/// every (context view, reply view) pair, context-major.
pub fn similarity_bank(ctx: &SentenceRepr, rpl: &SentenceRepr) -> Result<Vec<Tensor>> {
    let mut sims = vec![cosine_similarity(&ctx.full, &rpl.full)?];
    if let (Some(ctx_views), Some(rpl_views)) = (&ctx.views, &rpl.views) {
        for c in ctx_views.iter() {
            for r in rpl_views.iter() {
                sims.push(cosine_similarity(c, r)?);
            }
        }
    }
    Ok(sims)
}
