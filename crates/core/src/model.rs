//! Decoder-only transformer (GPT-style).
//!
//! Pre-norm blocks with RMSNorm, RoPE attention and a SwiGLU FFN. The output
//! projection is tied to the token embedding (logits = x · wteᵀ).

use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use kokomi_common::LlmConfig;

use crate::attention::{CausalSelfAttention, RotaryEmbedding};
use crate::ffn::FeedForward;
use crate::linear::WEIGHT_INIT;
use crate::norm::RmsNorm;

// ── Decoder Block ───────────────────────────────────────────────────────────

/// pre-norm → attention → residual → pre-norm → FFN → residual.
struct DecoderBlock {
    attention: CausalSelfAttention,
    attention_norm: RmsNorm,
    feed_forward: FeedForward,
    ffn_norm: RmsNorm,
}

impl DecoderBlock {
    fn new(config: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: CausalSelfAttention::new(config, vb.pp("attention"))?,
            attention_norm: RmsNorm::new(config.dim, config.norm_eps, vb.pp("attention_norm"))?,
            feed_forward: FeedForward::new(config, vb.pp("feed_forward"))?,
            ffn_norm: RmsNorm::new(config.dim, config.norm_eps, vb.pp("ffn_norm"))?,
        })
    }

    fn forward(&self, x: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        let h = (x + self
            .attention
            .forward(&self.attention_norm.forward(x)?, rope)?)?;
        &h + self.feed_forward.forward(&self.ffn_norm.forward(&h)?)?
    }
}

// ── Kokomi ──────────────────────────────────────────────────────────────────

/// The Kokomi language model.
pub struct Kokomi {
    tok_embeddings: Embedding,
    layers: Vec<DecoderBlock>,
    norm: RmsNorm,
    rope: RotaryEmbedding,
    config: LlmConfig,
}

impl Kokomi {
    pub fn new(vb: VarBuilder, config: &LlmConfig) -> Result<Self> {
        let wte = vb.pp("tok_embeddings").get_with_hints(
            (config.vocab_size, config.dim),
            "weight",
            WEIGHT_INIT,
        )?;
        let tok_embeddings = Embedding::new(wte, config.dim);

        let mut layers = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            layers.push(DecoderBlock::new(config, vb.pp(format!("layers.{i}")))?);
        }

        let norm = RmsNorm::new(config.dim, config.norm_eps, vb.pp("norm"))?;
        let rope = RotaryEmbedding::new(config, vb.device())?;

        Ok(Self {
            tok_embeddings,
            layers,
            norm,
            rope,
            config: config.clone(),
        })
    }

    /// Full-precision forward pass. `input_ids`: `(b, t)` u32 → logits `(b, t, vocab)` f32.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_autocast(input_ids, DType::F32)
    }

    /// Forward pass with activations and matmuls in `compute_dtype`. Logits
    /// are returned in `f32` for the loss.
    pub fn forward_autocast(&self, input_ids: &Tensor, compute_dtype: DType) -> Result<Tensor> {
        let mut x = self
            .tok_embeddings
            .forward(input_ids)?
            .to_dtype(compute_dtype)?;
        for layer in &self.layers {
            x = layer.forward(&x, &self.rope)?;
        }
        x = self.norm.forward(&x)?;

        // Weight-tied output projection: logits = x @ wte^T
        let wte = self.tok_embeddings.embeddings().to_dtype(compute_dtype)?;
        let (b, t, h) = x.dims3()?;
        let logits = x.reshape((b * t, h))?.matmul(&wte.t()?)?;
        logits
            .reshape((b, t, self.config.vocab_size))?
            .to_dtype(DType::F32)
    }
}

/// Trainable parameter count, from config alone.
pub fn parameter_count(config: &LlmConfig) -> usize {
    let dim = config.dim;
    let hidden = config.ffn_hidden_dim();
    let embedding = config.vocab_size * dim;
    let attention = 4 * dim * dim;
    let ffn = 3 * dim * hidden;
    let norms = 2 * dim;
    embedding + config.n_layers * (attention + ffn + norms) + dim
}
