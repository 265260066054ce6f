use std::path::Path;
use std::sync::PoisonError;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use tracing::{debug, info};

use crate::batch::{check_batch, label_tensor, token_tensor};
use crate::config::QaMemnetConfig;
use crate::embedder::{Embedder, EMBEDDING_WEIGHT};
use crate::encoder::SentenceEncoder;
use crate::error::{MemnetError, Result};
use crate::merge::MergeHead;
use crate::scoring::{binary_accuracy, contrastive_loss, ScoringHead};
use crate::similarity::{cosine_similarity, similarity_bank};

/// Loss and accuracy of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// The computation graph. Embedder and encoder weights are shared between
/// context and reply.
struct Network {
    embedder: Embedder,
    encoder: SentenceEncoder,
    merge: MergeHead,
    head: ScoringHead,
}

impl Network {
    fn new(config: &QaMemnetConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            embedder: Embedder::new(config, vb.clone())?,
            encoder: SentenceEncoder::new(config, vb.pp("sentence_encoder"))?,
            merge: MergeHead::new(config, vb.pp("merge"))?,
            head: ScoringHead::new(config.head_width(), vb.pp("scoring"))?,
        })
    }

    /// Similarity signals `(batch, head_width)`. The last column compares the
    /// reply with the context conditioned on it.
    fn signals(&self, ctx_ids: &Tensor, rpl_ids: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let ctx = self
            .encoder
            .encode(&self.embedder.forward(ctx_ids)?, train)?;
        let rpl = self
            .encoder
            .encode(&self.embedder.forward(rpl_ids)?, train)?;

        let mut sims = similarity_bank(&ctx, &rpl)?;
        let conditioned = self.merge.forward(&ctx.full, &rpl.full, train)?;
        sims.push(cosine_similarity(&conditioned, &rpl.full)?);

        Tensor::cat(&sims, 1)
    }

    fn forward(&self, ctx_ids: &Tensor, rpl_ids: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.head.forward(&self.signals(ctx_ids, rpl_ids, train)?)
    }
}

pub struct QaMemnet {
    config: QaMemnetConfig,
    device: Device,
    varmap: VarMap,
    network: Network,
    optimizer: AdamW,
}

fn adam_params(learning_rate: f64) -> ParamsAdamW {
    ParamsAdamW {
        lr: learning_rate,
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-7,
        weight_decay: 0.0,
    }
}

/// Variables the optimizer may update, in name order.
fn trainable_vars(varmap: &VarMap, embedding_frozen: bool) -> Vec<Var> {
    let data = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| !(embedding_frozen && name.as_str() == EMBEDDING_WEIGHT))
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, var)| var.clone()).collect()
}

impl QaMemnet {
    pub fn new(config: QaMemnetConfig) -> Result<Self> {
        config.validate()?;
        let device = if config.cudnn {
            Device::cuda_if_available(0)?
        } else {
            Device::Cpu
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = Network::new(&config, vb)?;
        let optimizer = AdamW::new(
            trainable_vars(&varmap, !config.train_embeddings),
            adam_params(config.learning_rate),
        )?;

        info!(
            vocab_size = config.vocab_size,
            dense_dim = config.dense_dim(),
            signals = config.head_width(),
            train_embeddings = config.train_embeddings,
            device = ?device,
            "built qa_memnet"
        );

        Ok(Self {
            config,
            device,
            varmap,
            network,
            optimizer,
        })
    }

    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(QaMemnetConfig::from_file(path)?)
    }

    pub fn config(&self) -> &QaMemnetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_embedding_frozen(&self) -> bool {
        !self.config.train_embeddings
    }

    /// Names and shapes of every stored parameter, sorted by name.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let data = self.varmap.data().lock().unwrap_or_else(PoisonError::into_inner);
        let mut shapes: Vec<(String, Vec<usize>)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect();
        shapes.sort();
        shapes
    }

    fn ids(&self, rows: &[Vec<u32>]) -> Result<Tensor> {
        token_tensor(rows, self.config.seq_len, self.config.vocab_size, &self.device)
    }

    /// Relevance scores `(batch, 1)` for aligned context/reply rows.
    pub fn forward(&self, contexts: &[Vec<u32>], replies: &[Vec<u32>], train: bool) -> Result<Tensor> {
        check_batch(contexts.len(), replies.len(), None)?;
        let ctx = self.ids(contexts)?;
        let rpl = self.ids(replies)?;
        Ok(self.network.forward(&ctx, &rpl, train)?)
    }

    /// One optimizer step on a batch of (context, reply) pairs with 0/1 labels.
    pub fn train_on_batch(
        &mut self,
        contexts: &[Vec<u32>],
        replies: &[Vec<u32>],
        labels: &[f32],
    ) -> Result<BatchMetrics> {
        check_batch(contexts.len(), replies.len(), Some(labels.len()))?;
        let scores = self.forward(contexts, replies, true)?;
        let y = label_tensor(labels, &self.device)?;

        let loss = contrastive_loss(&y, &scores, self.config.margin)?;
        self.optimizer.backward_step(&loss)?;

        let metrics = BatchMetrics {
            loss: loss.to_scalar::<f32>()?,
            accuracy: binary_accuracy(&y, &scores)?,
        };
        debug!(
            batch = labels.len(),
            loss = metrics.loss,
            accuracy = metrics.accuracy,
            "trained on batch"
        );
        Ok(metrics)
    }

    /// Inference-mode relevance score for each (context, reply) pair.
    pub fn predict_score_on_batch(&self, contexts: &[Vec<u32>], replies: &[Vec<u32>]) -> Result<Vec<f32>> {
        let scores = self.forward(contexts, replies, false)?;
        Ok(scores.flatten_all()?.to_vec1::<f32>()?)
    }

    /// Score one context against several candidate replies, best first.
    pub fn rank_replies(&self, context: &[u32], replies: &[Vec<u32>]) -> Result<Vec<(usize, f32)>> {
        if replies.is_empty() {
            return Ok(Vec::new());
        }
        let contexts = vec![context.to_vec(); replies.len()];
        let scores = self.predict_score_on_batch(&contexts, replies)?;
        let mut ranked: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    /// Install a pretrained `(vocab_size, emb_dim)` embedding matrix. It stays
    /// fixed during training unless `train_embeddings` is set.
    pub fn load_initial_emb_matrix(&mut self, matrix: &[Vec<f32>]) -> Result<()> {
        let expected = (self.config.vocab_size, self.config.emb_dim);
        let cols = matrix.first().map_or(0, Vec::len);
        if matrix.len() != expected.0 || matrix.iter().any(|row| row.len() != expected.1) {
            return Err(MemnetError::EmbeddingShape {
                expected,
                actual: (matrix.len(), cols),
            });
        }
        info!(vocab_size = expected.0, emb_dim = expected.1, "installing pretrained embeddings");

        let flat: Vec<f32> = matrix.iter().flatten().copied().collect();
        let weights = Tensor::from_vec(flat, expected, &self.device)?;
        self.varmap.set_one(EMBEDDING_WEIGHT, &weights)?;
        Ok(())
    }

    /// Read every parameter from a safetensors file written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(&mut self, load_path: P) -> Result<()> {
        let path = load_path.as_ref();
        info!(path = %path.display(), "initializing from saved weights");
        std::fs::metadata(path).map_err(|source| MemnetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.varmap.load(path)?;
        Ok(())
    }

    /// Write every parameter, frozen ones and normalization statistics
    /// included, as safetensors.
    pub fn save<P: AsRef<Path>>(&self, save_path: P) -> Result<()> {
        let path = save_path.as_ref();
        info!(path = %path.display(), "saving weights");
        self.varmap.save(path)?;
        Ok(())
    }
}
