//! Trainer: encapsulates the full pretraining loop.
//!
//! Each micro-step runs forward, masked loss and a scaled backward pass, and
//! sums the gradients into an accumulator. Every `accumulation_steps`
//! micro-steps the accumulator is unscaled, clipped and handed to AdamW.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use kokomi_common::{batch_to_tensors, Batch, DataLoader, LlmConfig};
use kokomi_core::Kokomi;

use crate::loss::{masked_loss, token_cross_entropy};
use crate::precision::{GradScaler, Precision};
use crate::scheduler::CosineSchedule;
use crate::tracker::{MetricRecord, MetricsTracker};

// ── Config ──────────────────────────────────────────────────────────────────

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub precision: Precision,
    pub accumulation_steps: usize,
    pub grad_clip: f64,
    /// Accepted for configuration compatibility; the schedule has no warmup.
    pub warmup_iters: usize,
    pub log_step: usize,
    pub save_step: usize,
    pub save_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 80,
            learning_rate: 5e-4,
            precision: Precision::Bf16,
            accumulation_steps: 2,
            grad_clip: 1.0,
            warmup_iters: 0,
            log_step: 10,
            save_step: 1000,
            save_dir: PathBuf::from("results"),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.accumulation_steps == 0 {
            anyhow::bail!("accumulation_steps must be >= 1");
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate must be > 0, got {}", self.learning_rate);
        }
        Ok(())
    }
}

/// Metrics returned after each micro-step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    /// Masked loss of this micro-batch, before division by `accumulation_steps`.
    pub loss: f32,
    pub lr: f64,
    /// Whether this micro-step closed an accumulation window.
    pub updated: bool,
    /// Pre-clip global gradient norm, when an optimiser step was taken.
    pub grad_norm: Option<f64>,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, scaler and gradient accumulator.
pub struct Trainer {
    pub model: Kokomi,
    pub varmap: VarMap,
    vars: Vec<Var>,
    optimizer: AdamW,
    scaler: GradScaler,
    accumulated: Option<GradStore>,
    pending: usize,
    compute_dtype: DType,
    pub config: TrainerConfig,
    model_config: LlmConfig,
    /// Number of optimiser updates applied so far.
    pub optimizer_steps: usize,
    device: Device,
}

impl Trainer {
    /// Construct a new Trainer. Builds the model from config.
    pub fn new(
        model_config: LlmConfig,
        trainer_config: TrainerConfig,
        device: Device,
    ) -> anyhow::Result<Self> {
        model_config.validate()?;
        trainer_config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Kokomi::new(vb, &model_config)?;
        let vars = varmap.all_vars();

        let params: usize = vars.iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            params_millions = %format!("{:.3}", params as f64 / 1e6),
            "LLM total parameters"
        );

        if trainer_config.warmup_iters > 0 {
            tracing::warn!(
                warmup_iters = trainer_config.warmup_iters,
                "warmup_iters is ignored: the cosine schedule has no warmup phase"
            );
        }

        let compute_dtype = trainer_config.precision.compute_dtype(&device);
        let scaler = GradScaler::for_precision(trainer_config.precision);
        tracing::info!(
            precision = %trainer_config.precision,
            compute_dtype = ?compute_dtype,
            loss_scaling = scaler.is_enabled(),
            "Mixed precision"
        );

        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: trainer_config.learning_rate,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            varmap,
            vars,
            optimizer,
            scaler,
            accumulated: None,
            pending: 0,
            compute_dtype,
            config: trainer_config,
            model_config,
            optimizer_steps: 0,
            device,
        })
    }

    /// One forward/backward pass at learning rate `lr`. Applies the
    /// optimiser once `accumulation_steps` passes have been accumulated.
    pub fn micro_step(&mut self, batch: &Batch, lr: f64) -> anyhow::Result<StepMetrics> {
        let accumulation_steps = self.config.accumulation_steps;
        self.optimizer.set_learning_rate(lr);

        let (x, y, loss_mask) = batch_to_tensors(batch, &self.device)?;
        let logits = self.model.forward_autocast(&x, self.compute_dtype)?;
        let per_token = token_cross_entropy(&logits, &y)?;
        let loss = masked_loss(&per_token, &loss_mask, accumulation_steps)?;
        let loss_val = loss.to_scalar::<f32>()?;
        tracing::debug!(
            valid_tokens = batch.num_valid_tokens(),
            loss = loss_val,
            "micro-step"
        );

        let scaled = loss.affine(self.scaler.scale(), 0.0)?;
        let grads = scaled.backward()?;
        self.accumulate(grads)?;
        self.pending += 1;

        let mut metrics = StepMetrics {
            loss: loss_val * accumulation_steps as f32,
            lr,
            updated: false,
            grad_norm: None,
        };
        if self.pending >= accumulation_steps {
            metrics.grad_norm = self.apply_update()?;
            metrics.updated = true;
        }
        Ok(metrics)
    }

    /// Sum a fresh backward pass into the accumulator.
    fn accumulate(&mut self, mut grads: GradStore) -> candle_core::Result<()> {
        match self.accumulated.as_mut() {
            None => self.accumulated = Some(grads),
            Some(acc) => {
                for var in &self.vars {
                    if let Some(g) = grads.remove(var.as_tensor()) {
                        let sum = match acc.remove(var.as_tensor()) {
                            Some(prev) => (prev + g)?,
                            None => g,
                        };
                        acc.insert(var.as_tensor(), sum);
                    }
                }
            }
        }
        Ok(())
    }

    /// Unscale → finite check → clip → AdamW → scaler update. Returns the
    /// pre-clip gradient norm, or `None` if the step was skipped on overflow.
    fn apply_update(&mut self) -> anyhow::Result<Option<f64>> {
        let mut grads = self
            .accumulated
            .take()
            .context("optimizer update with no accumulated gradients")?;
        self.pending = 0;

        let finite = self.scaler.unscale(&mut grads, &self.vars)?;
        let grad_norm = if finite {
            let norm = if self.config.grad_clip > 0.0 {
                clip_grad_norm(&mut grads, &self.vars, self.config.grad_clip)?
            } else {
                grad_norm(&grads, &self.vars)?
            };
            self.optimizer.step(&grads)?;
            self.optimizer_steps += 1;
            Some(norm)
        } else {
            tracing::warn!(
                scale = self.scaler.scale(),
                "non-finite gradients, skipping optimizer step"
            );
            None
        };
        self.scaler.update(finite);
        Ok(grad_norm)
    }

    /// Micro-steps accumulated since the last optimiser update.
    pub fn pending_micro_steps(&self) -> usize {
        self.pending
    }

    pub fn scaler(&self) -> &GradScaler {
        &self.scaler
    }

    /// One pass over `loader`. Logs every `log_step` micro-steps and saves a
    /// checkpoint whenever `(step + 1) % save_step == 0`.
    pub fn run_epoch(
        &mut self,
        loader: &DataLoader,
        epoch: usize,
        schedule: &CosineSchedule,
        mut tracker: Option<&mut (dyn MetricsTracker + '_)>,
    ) -> anyhow::Result<()> {
        let iters = loader.len();
        let start = Instant::now();

        for (step, batch) in loader.iter()?.enumerate() {
            let batch = batch?;
            let global_step = epoch * iters + step;
            let m = self.micro_step(&batch, schedule.lr_at(global_step))?;

            if self.config.log_step > 0 && step % self.config.log_step == 0 {
                let remaining = epoch_minutes_left(start.elapsed().as_secs_f64(), step, iters);
                tracing::info!(
                    "Epoch:[{}/{}]({}/{}) loss:{:.3} lr:{:.12} epoch_Time:{}min:",
                    epoch + 1,
                    self.config.epochs,
                    step,
                    iters,
                    m.loss,
                    m.lr,
                    remaining
                );
                if let Some(t) = tracker.as_deref_mut() {
                    t.log(&MetricRecord {
                        epoch,
                        step,
                        global_step,
                        loss: m.loss,
                        lr: m.lr,
                        epoch_time_min: remaining,
                    })?;
                }
            }
            if let Some(norm) = m.grad_norm {
                tracing::debug!(step = global_step, grad_norm = norm, "optimizer step");
            }

            if self.config.save_step > 0 && (step + 1) % self.config.save_step == 0 {
                let path = self.save_checkpoint(global_step)?;
                tracing::info!(path = %path.display(), "checkpoint saved");
            }
        }
        Ok(())
    }

    /// All epochs. A trailing partial accumulation window is discarded.
    pub fn train(
        &mut self,
        loader: &DataLoader,
        mut tracker: Option<&mut dyn MetricsTracker>,
    ) -> anyhow::Result<()> {
        let iters = loader.len();
        if iters == 0 {
            anyhow::bail!("data loader is empty");
        }
        let schedule = CosineSchedule::for_run(self.config.epochs, iters, self.config.learning_rate);
        tracing::info!(
            epochs = self.config.epochs,
            steps_per_epoch = iters,
            total_steps = schedule.total_steps(),
            effective_batch = loader.batch_size() * self.config.accumulation_steps,
            "Starting pretraining"
        );

        for epoch in 0..self.config.epochs {
            self.run_epoch(loader, epoch, &schedule, tracker.as_deref_mut())?;
        }

        if self.pending > 0 {
            tracing::debug!(pending = self.pending, "discarding partial accumulation");
            self.accumulated = None;
            self.pending = 0;
        }
        Ok(())
    }

    /// Save weights to `<save_dir>/pretrain_step<step>.safetensors`.
    pub fn save_checkpoint(&self, step: usize) -> anyhow::Result<PathBuf> {
        self.save_named(&format!("pretrain_step{step}.safetensors"))
    }

    /// Save final weights.
    pub fn save_final(&self) -> anyhow::Result<PathBuf> {
        self.save_named("pretrain_final.safetensors")
    }

    fn save_named(&self, file_name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.config.save_dir)
            .with_context(|| format!("create {}", self.config.save_dir.display()))?;
        let path = self.config.save_dir.join(file_name);
        self.varmap.save(&path)?;
        self.model_config
            .save(&self.config.save_dir.join("config.json"))?;
        Ok(path)
    }
}

/// Whole minutes left in the epoch, extrapolated from the time spent so far.
fn epoch_minutes_left(spent_secs: f64, step: usize, iters: usize) -> f64 {
    (spent_secs / (step + 1) as f64 * iters as f64 / 60.0).floor() - (spent_secs / 60.0).floor()
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> candle_core::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> candle_core::Result<f64> {
    let norm = grad_norm(grads, vars)?;
    if norm <= max_norm {
        return Ok(norm);
    }
    let scale = max_norm / (norm + 1e-6);
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(norm)
}

// ── Tests ───────────────────────────────────────────────────────────────────
