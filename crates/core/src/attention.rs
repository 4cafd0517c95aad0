//! Causal multi-head self-attention with rotary position embeddings.
//!
//! Q/K/V products run in the activation dtype; scores, the causal mask and
//! the softmax run in `f32`.

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use kokomi_common::LlmConfig;

use crate::linear::Linear;

// ── RoPE ────────────────────────────────────────────────────────────────────

/// Precomputed rotary tables, shape `(max_seq_len, head_dim / 2)`.
///
/// θ_i = theta^{-2i/d}; rotation is applied to the two halves of each head.
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(config: &LlmConfig, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let d2 = head_dim / 2;
        let theta = config.rope_theta as f32;
        let inv_freq: Vec<f32> = (0..d2)
            .map(|i| 1.0 / theta.powf(2.0 * i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, d2), device)?;
        let positions = Tensor::arange(0u32, config.max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((config.max_seq_len, 1))?;
        let freqs = positions.broadcast_mul(&inv_freq)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate `x` of shape `(b, heads, t, head_dim)`. Errors if `t` exceeds
    /// the table length.
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _h, t, d) = x.dims4()?;
        let half = d / 2;
        let cos = self.cos.narrow(0, 0, t)?.to_dtype(x.dtype())?;
        let sin = self.sin.narrow(0, 0, t)?.to_dtype(x.dtype())?;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let r1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let r2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Tensor::cat(&[&r1, &r2], D::Minus1)
    }
}

// ── Attention ───────────────────────────────────────────────────────────────

pub struct CausalSelfAttention {
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    n_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CausalSelfAttention {
    pub fn new(config: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        let head_dim = config.head_dim();
        Ok(Self {
            wq: Linear::new(dim, dim, vb.pp("wq"))?,
            wk: Linear::new(dim, dim, vb.pp("wk"))?,
            wv: Linear::new(dim, dim, vb.pp("wv"))?,
            wo: Linear::new(dim, dim, vb.pp("wo"))?,
            n_heads: config.n_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn split_heads(&self, x: &Tensor, b: usize, t: usize) -> Result<Tensor> {
        x.reshape((b, t, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, x: &Tensor, rope: &RotaryEmbedding) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let dtype = x.dtype();

        let q = rope.apply(&self.split_heads(&self.wq.forward(x)?, b, t)?)?;
        let k = rope.apply(&self.split_heads(&self.wk.forward(x)?, b, t)?)?;
        let v = self.split_heads(&self.wv.forward(x)?, b, t)?;

        let scores = (q.matmul(&k.t()?)?.to_dtype(DType::F32)? * self.scale)?;
        let scores = scores.broadcast_add(&causal_mask(t, x.device())?)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(dtype)?;

        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;
        self.wo.forward(&y)
    }
}

/// Additive mask `(1, 1, t, t)`: 0 on and below the diagonal, -1e9 above.
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let lower = Tensor::tril2(t, DType::F32, device)?;
    let ones = Tensor::ones((t, t), DType::F32, device)?;
    let neg_inf = ((ones - lower)? * -1e9)?;
    neg_inf.reshape((1, 1, t, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn small_config() -> LlmConfig {
        LlmConfig {
            vocab_size: 32,
            dim: 16,
            n_layers: 1,
            n_heads: 4,
            max_seq_len: 8,
            ..Default::default()
        }
    }

    #[test]
    fn rope_preserves_norm() {
        let config = small_config();
        let rope = RotaryEmbedding::new(&config, &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1., (1, 2, 8, 4), &Device::Cpu).unwrap();
        let y = rope.apply(&x).unwrap();
        let nx = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let ny = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((nx - ny).abs() / nx < 1e-4);
    }

    #[test]
    fn rope_rejects_sequences_past_table() {
        let config = small_config();
        let rope = RotaryEmbedding::new(&config, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 2, 9, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(rope.apply(&x).is_err());
    }

    #[test]
    fn attention_is_causal() {
        let config = small_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attn = CausalSelfAttention::new(&config, vb.pp("attn")).unwrap();
        let rope = RotaryEmbedding::new(&config, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1., (1, 6, 16), &Device::Cpu).unwrap();
        let y = attn.forward(&x, &rope).unwrap();
        assert_eq!(y.dims(), &[1, 6, 16]);

        // Changing the last position must not affect earlier outputs.
        let head = x.narrow(1, 0, 5).unwrap();
        let tail = Tensor::randn(0f32, 1., (1, 1, 16), &Device::Cpu).unwrap();
        let x2 = Tensor::cat(&[&head, &tail], 1).unwrap();
        let y2 = attn.forward(&x2, &rope).unwrap();
        let diff = (y.narrow(1, 0, 5).unwrap() - y2.narrow(1, 0, 5).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "prefix changed by {diff}");
    }
}
