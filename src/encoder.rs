use candle_core::{Result, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::VarBuilder;

use crate::config::{CellKind, QaMemnetConfig};

/// Encoded sentence: the full vector plus, when pooling, the three views it
/// was built from (last step, mean pool, max pool).
#[derive(Debug, Clone)]
pub struct SentenceRepr {
    pub full: Tensor,
    pub views: Option<[Tensor; 3]>,
}

enum Recurrent {
    Lstm(LSTM),
    Gru(GRU),
}

/// Dropout mask of ones scaled by `1 / (1 - p)`, zeroed with probability `p`.
fn dropout_mask(shape: (usize, usize), p: f32, like: &Tensor) -> Result<Tensor> {
    let ones = Tensor::ones(shape, like.dtype(), like.device())?;
    candle_nn::ops::dropout(&ones, p)
}

impl Recurrent {
    fn new(cell: CellKind, in_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match cell {
            CellKind::Lstm => Recurrent::Lstm(lstm(in_dim, hidden, LSTMConfig::default(), vb)?),
            CellKind::Gru => Recurrent::Gru(gru(in_dim, hidden, GRUConfig::default(), vb)?),
        })
    }

    /// `(batch, seq, in_dim)` to the hidden state at every step, `(batch, seq, hidden)`.
    ///
    /// `recurrent_mask` (`(batch, hidden)`) multiplies the state carried into
    /// the next step; the emitted outputs stay unmasked.
    fn run(&self, xs: &Tensor, recurrent_mask: Option<&Tensor>) -> Result<Tensor> {
        let (batch, steps, _) = xs.dims3()?;
        let mut outputs = Vec::with_capacity(steps);
        match self {
            Recurrent::Lstm(cell) => {
                let mut state = cell.zero_state(batch)?;
                for t in 0..steps {
                    let x = xs.narrow(1, t, 1)?.squeeze(1)?;
                    let next = cell.step(&x, &state)?;
                    outputs.push(next.h.clone());
                    state = match recurrent_mask {
                        Some(mask) => LSTMState {
                            h: next.h.mul(mask)?,
                            c: next.c,
                        },
                        None => next,
                    };
                }
            }
            Recurrent::Gru(cell) => {
                let mut state = cell.zero_state(batch)?;
                for t in 0..steps {
                    let x = xs.narrow(1, t, 1)?.squeeze(1)?;
                    let next = cell.step(&x, &state)?;
                    outputs.push(next.h.clone());
                    state = match recurrent_mask {
                        Some(mask) => GRUState {
                            h: next.h.mul(mask)?,
                        },
                        None => next,
                    };
                }
            }
        }
        Tensor::stack(&outputs, 1)
    }
}

struct Layer {
    forward: Recurrent,
    backward: Option<Recurrent>,
}

pub struct SentenceEncoder {
    layers: Vec<Layer>,
    input_dropout: f32,
    recurrent_dropout: f32,
    hidden: usize,
    bidirectional: bool,
    pool: bool,
}

/// Reverse the time axis of a `(batch, seq, dim)` tensor.
fn reverse_time(xs: &Tensor) -> Result<Tensor> {
    let seq = xs.dim(1)?;
    let idx: Vec<u32> = (0..seq as u32).rev().collect();
    let idx = Tensor::from_vec(idx, seq, xs.device())?;
    xs.index_select(&idx, 1)
}

impl SentenceEncoder {
    pub fn new(config: &QaMemnetConfig, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.layers);
        let mut in_dim = config.emb_dim;
        for li in 0..config.layers {
            let lvb = vb.pp(format!("layer{li}"));
            let forward = Recurrent::new(config.cell, in_dim, config.lstm_dim, lvb.pp("forward"))?;
            let backward = if config.bidirectional {
                Some(Recurrent::new(
                    config.cell,
                    in_dim,
                    config.lstm_dim,
                    lvb.pp("backward"),
                )?)
            } else {
                None
            };
            layers.push(Layer { forward, backward });
            in_dim = config.sub_dim();
        }

        // only plain forward-only cells take dropout
        let (input_dropout, recurrent_dropout) = if !config.cudnn && !config.bidirectional {
            (config.input_dropout, config.recurrent_dropout)
        } else {
            (0.0, 0.0)
        };

        Ok(Self {
            layers,
            input_dropout,
            recurrent_dropout,
            hidden: config.lstm_dim,
            bidirectional: config.bidirectional,
            pool: config.pool,
        })
    }

    /// Full output sequence of the last layer, `(batch, seq, sub_dim)`.
    ///
    /// In training, dropout masks are drawn once per sequence and reused at
    /// every time step.
    pub fn sequence(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            let (batch, _, in_dim) = xs.dims3()?;
            if train && self.input_dropout > 0.0 {
                let mask = dropout_mask((batch, in_dim), self.input_dropout, &xs)?;
                xs = xs.broadcast_mul(&mask.unsqueeze(1)?)?;
            }
            let recurrent_mask = if train && self.recurrent_dropout > 0.0 {
                Some(dropout_mask((batch, self.hidden), self.recurrent_dropout, &xs)?)
            } else {
                None
            };

            let fwd = layer.forward.run(&xs, recurrent_mask.as_ref())?;
            xs = match &layer.backward {
                Some(backward) => {
                    let bwd = reverse_time(&backward.run(&reverse_time(&xs)?, None)?)?;
                    Tensor::cat(&[&fwd, &bwd], 2)?
                }
                None => fwd,
            };
        }
        Ok(xs)
    }

    /// Last step of the sequence. For bidirectional outputs the backward half
    /// is taken at t = 0, where that direction finished reading.
    pub fn last_step(&self, seq: &Tensor) -> Result<Tensor> {
        let steps = seq.dim(1)?;
        if !self.bidirectional {
            return seq.narrow(1, steps - 1, 1)?.squeeze(1);
        }
        let fwd = seq.narrow(2, 0, self.hidden)?.narrow(1, steps - 1, 1)?.squeeze(1)?;
        let bwd = seq.narrow(2, self.hidden, self.hidden)?.narrow(1, 0, 1)?.squeeze(1)?;
        Tensor::cat(&[&fwd, &bwd], 1)
    }

    /// Encode embedded tokens `(batch, seq, emb_dim)` into a sentence representation.
    pub fn encode(&self, xs: &Tensor, train: bool) -> Result<SentenceRepr> {
        let seq = self.sequence(xs, train)?;
        let last = self.last_step(&seq)?;
        if !self.pool {
            return Ok(SentenceRepr {
                full: last,
                views: None,
            });
        }
        let mean = seq.mean(1)?;
        let max = seq.max(1)?;
        let full = Tensor::cat(&[&last, &mean, &max], 1)?;
        Ok(SentenceRepr {
            full,
            views: Some([last, mean, max]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn config(bidirectional: bool, pool: bool, cell: CellKind) -> QaMemnetConfig {
        let mut config = QaMemnetConfig::new(10);
        config.emb_dim = 4;
        config.lstm_dim = 3;
        config.seq_len = 6;
        config.layers = 2;
        config.bidirectional = bidirectional;
        config.pool = pool;
        config.cell = cell;
        config
    }

    fn encoder(config: &QaMemnetConfig) -> (VarMap, SentenceEncoder) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SentenceEncoder::new(config, vb).unwrap();
        (varmap, encoder)
    }

    fn total_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_bidirectional_pooled_shapes() {
        let config = config(true, true, CellKind::Lstm);
        let (_varmap, encoder) = encoder(&config);
        let xs = Tensor::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap();
        let repr = encoder.encode(&xs, false).unwrap();
        assert_eq!(repr.full.dims(), &[2, config.dense_dim()]);
        let views = repr.views.unwrap();
        for view in views.iter() {
            assert_eq!(view.dims(), &[2, config.sub_dim()]);
        }
    }

    #[test]
    fn test_forward_only_without_pool() {
        let config = config(false, false, CellKind::Gru);
        let (_varmap, encoder) = encoder(&config);
        let xs = Tensor::randn(0f32, 1.0, (3, 6, 4), &Device::Cpu).unwrap();
        let repr = encoder.encode(&xs, false).unwrap();
        assert_eq!(repr.full.dims(), &[3, 3]);
        assert!(repr.views.is_none());
    }

    #[test]
    fn test_last_step_takes_backward_half_at_start() {
        let config = config(true, true, CellKind::Lstm);
        let (_varmap, encoder) = encoder(&config);
        // one row, 3 steps, width 6: value = 10 * t + feature
        let data: Vec<f32> = (0..3)
            .flat_map(|t| (0..6).map(move |f| (10 * t + f) as f32))
            .collect();
        let seq = Tensor::from_vec(data, (1, 3, 6), &Device::Cpu).unwrap();
        let last = encoder.last_step(&seq).unwrap();
        let last = last.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(last, vec![20.0, 21.0, 22.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_reverse_time() {
        let data: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let xs = Tensor::from_vec(data, (1, 3, 2), &Device::Cpu).unwrap();
        let rev = reverse_time(&xs).unwrap();
        let rev = rev.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(rev, vec![4.0, 5.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_forward_last_step_of_known_sequence() {
        let config = config(false, true, CellKind::Lstm);
        let (_varmap, encoder) = encoder(&config);
        // steps: [1, 5, -2], [3, 0, 4], [2, -1, 1]
        let seq = Tensor::from_vec(
            vec![1f32, 5.0, -2.0, 3.0, 0.0, 4.0, 2.0, -1.0, 1.0],
            (1, 3, 3),
            &Device::Cpu,
        )
        .unwrap();
        let last = encoder.last_step(&seq).unwrap();
        assert_eq!(
            last.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, -1.0, 1.0]
        );
        let mean = seq.mean(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (got, want) in mean.iter().zip([2.0f32, 4.0 / 3.0, 1.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
        let max = seq.max(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(max, vec![3.0, 5.0, 4.0]);
    }

    #[test]
    fn test_shared_weights_give_identical_encodings() {
        let config = config(true, true, CellKind::Lstm);
        let (_varmap, encoder) = encoder(&config);
        let xs = Tensor::randn(0f32, 1.0, (1, 6, 4), &Device::Cpu).unwrap();
        let a = encoder.encode(&xs, false).unwrap().full;
        let b = encoder.encode(&xs, false).unwrap().full;
        assert_eq!(total_abs_diff(&a, &b), 0.0);
    }

    #[test]
    fn test_gru_sequence_keeps_time_axis() {
        for bidirectional in [false, true] {
            let config = config(bidirectional, true, CellKind::Gru);
            let (_varmap, encoder) = encoder(&config);
            let xs = Tensor::randn(0f32, 1.0, (2, 6, 4), &Device::Cpu).unwrap();
            let seq = encoder.sequence(&xs, false).unwrap();
            assert_eq!(seq.dims(), &[2, 6, config.sub_dim()]);
            let repr = encoder.encode(&xs, false).unwrap();
            assert_eq!(repr.full.dims(), &[2, config.dense_dim()]);
        }
    }

    #[test]
    fn test_recurrent_dropout_only_in_training() {
        let mut config = config(false, true, CellKind::Lstm);
        config.cudnn = false;
        config.input_dropout = 0.0;
        config.recurrent_dropout = 0.5;
        let (_varmap, encoder) = encoder(&config);
        let xs = Tensor::randn(0f32, 1.0, (4, 6, 4), &Device::Cpu).unwrap();

        let a = encoder.sequence(&xs, false).unwrap();
        let b = encoder.sequence(&xs, false).unwrap();
        assert_eq!(total_abs_diff(&a, &b), 0.0);

        let differs = (0..5).any(|_| {
            let c = encoder.sequence(&xs, true).unwrap();
            let d = encoder.sequence(&xs, true).unwrap();
            total_abs_diff(&c, &d) > 0.0
        });
        assert!(differs);
    }

    #[test]
    fn test_input_dropout_only_in_training() {
        let mut config = config(false, true, CellKind::Gru);
        config.cudnn = false;
        config.input_dropout = 0.5;
        config.recurrent_dropout = 0.0;
        let (_varmap, encoder) = encoder(&config);
        let xs = Tensor::randn(0f32, 1.0, (4, 6, 4), &Device::Cpu).unwrap();

        let a = encoder.encode(&xs, false).unwrap().full;
        let b = encoder.encode(&xs, false).unwrap().full;
        assert_eq!(total_abs_diff(&a, &b), 0.0);

        let differs = (0..5).any(|_| {
            let c = encoder.encode(&xs, true).unwrap().full;
            let d = encoder.encode(&xs, true).unwrap().full;
            total_abs_diff(&c, &d) > 0.0
        });
        assert!(differs);
    }

    #[test]
    fn test_bidirectional_and_fused_cells_ignore_dropout() {
        for (bidirectional, cudnn) in [(true, false), (false, true)] {
            let mut config = config(bidirectional, true, CellKind::Lstm);
            config.cudnn = cudnn;
            config.input_dropout = 0.5;
            config.recurrent_dropout = 0.5;
            let (_varmap, encoder) = encoder(&config);
            let xs = Tensor::randn(0f32, 1.0, (4, 6, 4), &Device::Cpu).unwrap();
            let a = encoder.encode(&xs, true).unwrap().full;
            let b = encoder.encode(&xs, true).unwrap().full;
            assert_eq!(total_abs_diff(&a, &b), 0.0);
        }
    }
}
