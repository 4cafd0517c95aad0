//! # kokomi-core — The Model
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`linear`] | `Linear` with f32 master weights cast to the activation dtype |
//! | [`norm`] | `RmsNorm` (statistics in f32) |
//! | [`attention`] | `CausalSelfAttention`, `RotaryEmbedding` |
//! | [`ffn`] | SwiGLU `FeedForward` |
//! | [`model`] | `Kokomi` (full transformer), `parameter_count` |
//!
//! Everything goes through `candle-core` / `candle-nn`, so the same code
//! trains on CPU, CUDA and Metal.

pub mod attention;
pub mod ffn;
pub mod linear;
pub mod model;
pub mod norm;

pub use model::{parameter_count, Kokomi};
