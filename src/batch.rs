use candle_core::{Device, Tensor};
use rayon::prelude::*;

use crate::error::{MemnetError, Result};

/// Use rayon only for larger batches.
const PARALLEL_THRESHOLD: usize = 256;

/// Fit one token row to `seq_len`: zeros in front of short rows, only the
/// last `seq_len` tokens of long rows.
pub fn fit_row(row: &[u32], seq_len: usize, vocab_size: usize) -> Result<Vec<u32>> {
    if let Some(&token) = row.iter().find(|&&t| t as usize >= vocab_size) {
        return Err(MemnetError::TokenOutOfRange { token, vocab_size });
    }
    let mut out = vec![0u32; seq_len];
    let keep = row.len().min(seq_len);
    out[seq_len - keep..].copy_from_slice(&row[row.len() - keep..]);
    Ok(out)
}

/// Fit every row and pack the batch into a `(batch, seq_len)` id tensor.
pub fn token_tensor(
    rows: &[Vec<u32>],
    seq_len: usize,
    vocab_size: usize,
    device: &Device,
) -> Result<Tensor> {
    let fitted: Vec<Vec<u32>> = if rows.len() < PARALLEL_THRESHOLD {
        rows.iter()
            .map(|row| fit_row(row, seq_len, vocab_size))
            .collect::<Result<_>>()?
    } else {
        rows.par_iter()
            .map(|row| fit_row(row, seq_len, vocab_size))
            .collect::<Result<_>>()?
    };
    let flat: Vec<u32> = fitted.into_iter().flatten().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), seq_len), device)?)
}

/// Labels as a `(batch, 1)` float tensor.
pub fn label_tensor(labels: &[f32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(labels, (labels.len(), 1), device)?)
}

/// Check that contexts, replies and (optionally) labels line up.
pub fn check_batch(contexts: usize, replies: usize, labels: Option<usize>) -> Result<()> {
    let label_count = labels.unwrap_or(contexts);
    let what = if contexts == 0 {
        "empty batch"
    } else if contexts != replies {
        "contexts and replies differ in length"
    } else if label_count != contexts {
        "labels differ in length from the batch"
    } else {
        return Ok(());
    };
    Err(MemnetError::BatchShape {
        what,
        contexts,
        replies,
        labels: label_count,
    })
}

/// Split a `[contexts, replies]` batch into its two halves.
pub fn split_pair(parts: Vec<Vec<Vec<u32>>>) -> Result<(Vec<Vec<u32>>, Vec<Vec<u32>>)> {
    let count = parts.len();
    let mut parts = parts.into_iter();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(contexts), Some(replies), None) => Ok((contexts, replies)),
        _ => Err(MemnetError::BatchParts(count)),
    }
}
