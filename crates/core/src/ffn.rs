//! SwiGLU feed-forward network.
//!
//! ```text
//! out = W_down( SiLU(W_gate(x)) ⊙ W_up(x) )
//! ```

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use kokomi_common::LlmConfig;

use crate::linear::Linear;

pub struct FeedForward {
    w_gate: Linear,
    w_up: Linear,
    w_down: Linear,
}

impl FeedForward {
    pub fn new(config: &LlmConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.ffn_hidden_dim();
        Ok(Self {
            w_gate: Linear::new(config.dim, hidden, vb.pp("w_gate"))?,
            w_up: Linear::new(config.dim, hidden, vb.pp("w_up"))?,
            w_down: Linear::new(hidden, config.dim, vb.pp("w_down"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.w_gate.forward(x)?)?;
        let up = self.w_up.forward(x)?;
        self.w_down.forward(&(gate * up)?)
    }
}
