//! # kokomi-common — Shared Primitives
//!
//! Types shared by the model and the training loop:
//!
//! * **[`LlmConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`PretrainDataset`]** / **[`DataLoader`]** — JSONL corpus, padding, batching.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

pub mod config;
pub mod data;

pub use config::LlmConfig;
pub use data::{
    batch_to_tensors, Batch, BatchIter, DataLoader, HfTokenizer, PretrainDataset, Sample,
    TextEncoder,
};
