//! Learning rate schedule: cosine decay above a floor of `base_lr / 10`.
//!
//! ```text
//! lr(s) = base_lr/10 + 0.5 · base_lr · (1 + cos(π · s / total))
//! ```
//!
//! Starts at `1.1 · base_lr` and ends at `base_lr / 10` when `s == total`.
//! There is no warmup phase.

use std::f64::consts::PI;

/// Learning rate at `current_step` of `total_steps`.
///
/// `total_steps` must be non-zero. Steps past `total_steps` keep following
/// the cosine back up; the caller stops training at `total_steps`.
pub fn get_lr(current_step: usize, total_steps: usize, base_lr: f64) -> f64 {
    debug_assert!(total_steps > 0, "total_steps must be > 0");
    let progress = current_step as f64 / total_steps as f64;
    base_lr / 10.0 + 0.5 * base_lr * (1.0 + (PI * progress).cos())
}

// ── CosineSchedule ──────────────────────────────────────────────────────────

/// The run-level parameters of [`get_lr`]. Holds no step state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSchedule {
    total_steps: usize,
    base_lr: f64,
}

impl CosineSchedule {
    pub fn new(total_steps: usize, base_lr: f64) -> Self {
        Self {
            total_steps,
            base_lr,
        }
    }

    /// Schedule for `epochs × steps_per_epoch` global steps.
    pub fn for_run(epochs: usize, steps_per_epoch: usize, base_lr: f64) -> Self {
        Self::new(epochs * steps_per_epoch, base_lr)
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        get_lr(step, self.total_steps, self.base_lr)
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
