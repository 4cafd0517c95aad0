//! Linear projection whose master weight stays `f32` in the `VarMap`.
//!
//! The weight is cast to the activation dtype on every forward, so feeding
//! `bf16` / `f16` activations runs the matmul in reduced precision while the
//! optimiser keeps updating full-precision weights. The cast is part of the
//! autograd graph; gradients land back on the `f32` variable.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

/// Weight init shared by every projection and the token embedding.
pub const WEIGHT_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

/// Bias-free linear layer, `y = x · Wᵀ`.
pub struct Linear {
    weight: Tensor,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((out_dim, in_dim), "weight", WEIGHT_INIT)?;
        Ok(Self { weight })
    }
}

impl Module for Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.to_dtype(x.dtype())?;
        x.broadcast_matmul(&w.t()?)
    }
}
