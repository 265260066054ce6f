use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemnetError, Result};

/// Recurrent cell used by the sentence encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Lstm,
    Gru,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaMemnetConfig {
    #[serde(alias = "voc_siz")]
    pub vocab_size: usize,
    #[serde(default = "default_emb_dim")]
    pub emb_dim: usize,
    #[serde(alias = "bdr", default = "default_true")]
    pub bidirectional: bool,
    #[serde(default = "default_true")]
    pub pool: bool,
    /// Run on the accelerated device when one is available. Matches the
    /// fused-kernel cells, which take no per-step input dropout.
    #[serde(default = "default_true")]
    pub cudnn: bool,
    #[serde(default)]
    pub cell: CellKind,
    #[serde(alias = "edp", default)]
    pub input_dropout: f32,
    #[serde(alias = "rdp", default = "default_recurrent_dropout")]
    pub recurrent_dropout: f32,
    #[serde(alias = "drp", default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_lstm_dim")]
    pub lstm_dim: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    #[serde(default = "default_layers")]
    pub layers: usize,
    #[serde(alias = "dlrs", default = "default_merge_layers")]
    pub merge_layers: usize,
    #[serde(default)]
    pub weighted_embeddings: bool,
    #[serde(default)]
    pub transformed_embeddings: bool,
    /// Update the embedding table during training. Off by default, so a
    /// pretrained table stays fixed.
    #[serde(default)]
    pub train_embeddings: bool,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_margin")]
    pub margin: f64,
}

fn default_emb_dim() -> usize {
    300
}

fn default_true() -> bool {
    true
}

fn default_recurrent_dropout() -> f32 {
    0.1
}

fn default_dropout() -> f32 {
    0.2
}

fn default_lstm_dim() -> usize {
    300
}

fn default_seq_len() -> usize {
    20
}

fn default_layers() -> usize {
    2
}

fn default_merge_layers() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    0.001
}

fn default_margin() -> f64 {
    1.0
}

impl QaMemnetConfig {
    /// Default hyper-parameters for a vocabulary of `vocab_size` tokens.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            emb_dim: default_emb_dim(),
            bidirectional: true,
            pool: true,
            cudnn: true,
            cell: CellKind::Lstm,
            input_dropout: 0.0,
            recurrent_dropout: default_recurrent_dropout(),
            dropout: default_dropout(),
            lstm_dim: default_lstm_dim(),
            seq_len: default_seq_len(),
            layers: default_layers(),
            merge_layers: default_merge_layers(),
            weighted_embeddings: false,
            transformed_embeddings: false,
            train_embeddings: false,
            learning_rate: default_learning_rate(),
            margin: default_margin(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| MemnetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Width of one sub-view (last step, mean or max pool).
    pub fn sub_dim(&self) -> usize {
        if self.bidirectional {
            self.lstm_dim * 2
        } else {
            self.lstm_dim
        }
    }

    /// Width of the full sentence representation.
    pub fn dense_dim(&self) -> usize {
        if self.pool {
            self.sub_dim() * 3
        } else {
            self.sub_dim()
        }
    }

    /// Number of similarity signals fed to the scoring head.
    pub fn head_width(&self) -> usize {
        if self.pool {
            11
        } else {
            2
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("emb_dim", self.emb_dim),
            ("lstm_dim", self.lstm_dim),
            ("seq_len", self.seq_len),
            ("layers", self.layers),
            ("merge_layers", self.merge_layers),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(MemnetError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        let rates = [
            ("input_dropout", self.input_dropout),
            ("recurrent_dropout", self.recurrent_dropout),
            ("dropout", self.dropout),
        ];
        for (name, value) in rates {
            if !(0.0..1.0).contains(&value) {
                return Err(MemnetError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {value}"
                )));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(MemnetError::InvalidConfig(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(self.margin > 0.0) {
            return Err(MemnetError::InvalidConfig(format!(
                "margin must be > 0, got {}",
                self.margin
            )));
        }
        Ok(())
    }
}
