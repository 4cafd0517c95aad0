//! Mixed-precision support: compute dtype selection and dynamic loss scaling.
//!
//! The loss is multiplied by the current scale before backward; gradients
//! are divided by it again before clipping. A non-finite gradient skips the
//! optimiser step and halves the scale; 2000 clean steps in a row double it.

use std::fmt;
use std::str::FromStr;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Var};

/// Training numeric precision, parsed from `float32` / `float16` / `bfloat16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn name(&self) -> &'static str {
        match self {
            Precision::Fp32 => "float32",
            Precision::Fp16 => "float16",
            Precision::Bf16 => "bfloat16",
        }
    }

    /// Whether this is a reduced precision type.
    pub fn is_reduced(&self) -> bool {
        matches!(self, Precision::Fp16 | Precision::Bf16)
    }

    pub fn dtype(&self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }

    /// Dtype the forward pass runs in on `device`. Autocast only applies on
    /// accelerators; CPU always computes in f32.
    pub fn compute_dtype(&self, device: &Device) -> DType {
        if device.is_cpu() {
            DType::F32
        } else {
            self.dtype()
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "float32" | "fp32" | "f32" => Ok(Self::Fp32),
            "float16" | "fp16" | "f16" => Ok(Self::Fp16),
            "bfloat16" | "bf16" => Ok(Self::Bf16),
            other => anyhow::bail!("unknown dtype {other:?} (float32, float16, bfloat16)"),
        }
    }
}

// ── GradScaler ──────────────────────────────────────────────────────────────

const INITIAL_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: usize = 2000;

/// Dynamic loss scaler. A disabled scaler has scale 1 and never changes.
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    enabled: bool,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    steps_since_growth: usize,
    overflow_count: usize,
}

impl GradScaler {
    pub fn new(enabled: bool) -> Self {
        Self {
            scale: if enabled { INITIAL_SCALE } else { 1.0 },
            enabled,
            growth_factor: GROWTH_FACTOR,
            backoff_factor: BACKOFF_FACTOR,
            growth_interval: GROWTH_INTERVAL,
            steps_since_growth: 0,
            overflow_count: 0,
        }
    }

    /// Enabled for float16 and bfloat16.
    pub fn for_precision(precision: Precision) -> Self {
        Self::new(precision.is_reduced())
    }

    pub fn with_growth_interval(mut self, interval: usize) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count
    }

    /// Divide every gradient of `vars` by the scale in place. Returns `true`
    /// if all gradients are finite.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> candle_core::Result<bool> {
        let inv_scale = 1.0 / self.scale;
        let mut finite = true;
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                let g = if self.enabled { g.affine(inv_scale, 0.0)? } else { g };
                // inf and NaN both survive a plain sum
                let total = g.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                if !total.is_finite() {
                    finite = false;
                }
                grads.insert(var.as_tensor(), g);
            }
        }
        Ok(finite)
    }

    /// Advance the scale after an accumulation boundary.
    pub fn update(&mut self, grads_finite: bool) {
        if !self.enabled {
            return;
        }
        if grads_finite {
            self.steps_since_growth += 1;
            if self.steps_since_growth >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.steps_since_growth = 0;
            }
        } else {
            self.overflow_count += 1;
            self.scale = (self.scale * self.backoff_factor).max(1.0);
            self.steps_since_growth = 0;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
