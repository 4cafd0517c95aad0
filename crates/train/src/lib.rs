//! # kokomi-train — pretraining loop
//!
//! * **[`Trainer`]** — owns model + AdamW + loss scaler. [`Trainer::micro_step`]
//!   runs forward, masked loss and backward, and applies an optimiser update
//!   every `accumulation_steps` calls.
//! * **[`CosineSchedule`]** — cosine decay from `1.1 · lr` to `lr / 10`.
//! * **[`GradScaler`]** — dynamic loss scaling for float16 / bfloat16 runs.
//! * **[`MetricsTracker`]** — where logged metrics go besides the log.

pub mod loss;
pub mod precision;
pub mod scheduler;
pub mod tracker;
pub mod trainer;

pub use loss::{masked_loss, token_cross_entropy};
pub use precision::{GradScaler, Precision};
pub use scheduler::{get_lr, CosineSchedule};
pub use tracker::{run_name, JsonlTracker, MemoryTracker, MetricRecord, MetricsTracker};
pub use trainer::{StepMetrics, Trainer, TrainerConfig};
