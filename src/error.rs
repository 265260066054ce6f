use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building, training, scoring or persisting the model.
#[derive(Debug, Error)]
pub enum MemnetError {
    /// A tensor operation failed inside candle.
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Reading or writing a file failed.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration parsed but describes an unusable model.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Context, reply and label batches disagree, or a batch is empty.
    #[error("batch shape mismatch: {what} (contexts={contexts}, replies={replies}, labels={labels})")]
    BatchShape {
        what: &'static str,
        contexts: usize,
        replies: usize,
        labels: usize,
    },

    /// A paired batch is not `[contexts, replies]`.
    #[error("batch must hold [contexts, replies], got {0} parts")]
    BatchParts(usize),

    /// A token id does not fit the embedding table.
    #[error("token id {token} out of range for vocabulary of size {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    /// A pretrained embedding matrix has the wrong shape.
    #[error("embedding matrix shape mismatch: expected {expected:?}, got {actual:?}")]
    EmbeddingShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

impl MemnetError {
    /// True for errors caused by the caller's input rather than the runtime.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            MemnetError::Json(_)
                | MemnetError::InvalidConfig(_)
                | MemnetError::BatchShape { .. }
                | MemnetError::BatchParts(_)
                | MemnetError::TokenOutOfRange { .. }
                | MemnetError::EmbeddingShape { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MemnetError>;
