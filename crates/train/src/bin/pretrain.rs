//! CLI for pretraining Kokomi from a JSONL corpus.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use candle_core::Device;
use clap::Parser;

use kokomi_common::{DataLoader, HfTokenizer, LlmConfig, PretrainDataset};
use kokomi_train::{run_name, JsonlTracker, MetricsTracker, Precision, Trainer, TrainerConfig};

#[derive(Parser, Debug)]
#[command(name = "kokomi-pretrain", about = "Kokomi Pretraining")]
struct Args {
    #[arg(long, default_value = "results")]
    save_dir: PathBuf,
    #[arg(long, default_value = "1")]
    epochs: usize,
    #[arg(long, default_value = "80")]
    batch_size: usize,
    #[arg(long, default_value = "5e-4")]
    learning_rate: f64,
    /// `auto`, `cpu`, `cuda:N` or `metal:N`.
    #[arg(long, default_value = "auto")]
    device: String,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    use_tracker: bool,
    #[arg(long, default_value = "Kokomi-Pretrain")]
    tracker_project: String,
    #[arg(long, default_value = "bfloat16")]
    dtype: Precision,
    #[arg(long, default_value = "1")]
    num_workers: usize,
    #[arg(long, default_value = "2")]
    accumulation_steps: usize,
    #[arg(long, default_value = "1.0")]
    grad_clip: f64,
    #[arg(long, default_value = "0")]
    warmup_iters: usize,
    #[arg(long, default_value = "10")]
    log_step: usize,
    #[arg(long, default_value = "1000")]
    save_step: usize,
    #[arg(long, default_value = "512")]
    max_seq_len: usize,
    #[arg(long, default_value = "pretrain.jsonl")]
    data_path: PathBuf,
    #[arg(long, default_value = "./Kokomi_tokenizer/tokenizer.json")]
    tokenizer: PathBuf,
    /// Model hyper-parameters as JSON; defaults are used when omitted.
    #[arg(long)]
    model_config: Option<PathBuf>,
    #[arg(long, default_value = "1337")]
    seed: u64,
}

fn parse_device(spec: &str) -> anyhow::Result<Device> {
    let ordinal = |s: &str| -> anyhow::Result<usize> {
        s.parse()
            .with_context(|| format!("invalid device ordinal in {spec:?}"))
    };
    match spec {
        "auto" => Ok(Device::cuda_if_available(0)?),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" => Ok(Device::new_metal(0)?),
        _ => {
            if let Some(n) = spec.strip_prefix("cuda:") {
                Ok(Device::new_cuda(ordinal(n)?)?)
            } else if let Some(n) = spec.strip_prefix("metal:") {
                Ok(Device::new_metal(ordinal(n)?)?)
            } else {
                anyhow::bail!("unknown device {spec:?} (auto, cpu, cuda:N, metal:N)")
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut model_config = match &args.model_config {
        Some(path) => LlmConfig::load(path)?,
        None => LlmConfig::default(),
    };
    model_config.max_seq_len = args.max_seq_len;

    let device = parse_device(&args.device)?;
    if device.is_cpu() {
        tracing::debug!(seed = args.seed, "CPU backend has no seedable generator");
    } else {
        device.set_seed(args.seed)?;
    }

    let tokens_per_iter = args.batch_size * args.max_seq_len;
    tracing::info!(
        device = ?device,
        dtype = %args.dtype,
        tokens_per_iter,
        "Run setup"
    );

    let tokenizer = HfTokenizer::from_file(&args.tokenizer)?;
    if tokenizer.vocab_size() > model_config.vocab_size {
        anyhow::bail!(
            "tokenizer has {} tokens but the model vocabulary is {}",
            tokenizer.vocab_size(),
            model_config.vocab_size
        );
    }
    let dataset = PretrainDataset::open(&args.data_path, Arc::new(tokenizer), args.max_seq_len)?;
    if dataset.is_empty() {
        anyhow::bail!("no records in {}", args.data_path.display());
    }
    tracing::info!(records = dataset.len(), "Dataset loaded");
    let loader = DataLoader::new(Arc::new(dataset), args.batch_size, args.num_workers)?;

    let mut tracker = if args.use_tracker {
        Some(JsonlTracker::create(
            &args.save_dir,
            &args.tracker_project,
            &run_name(args.epochs, args.batch_size, args.learning_rate),
        )?)
    } else {
        None
    };

    let trainer_config = TrainerConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        precision: args.dtype,
        accumulation_steps: args.accumulation_steps,
        grad_clip: args.grad_clip,
        warmup_iters: args.warmup_iters,
        log_step: args.log_step,
        save_step: args.save_step,
        save_dir: args.save_dir.clone(),
    };
    let mut trainer = Trainer::new(model_config, trainer_config, device)?;

    trainer.train(
        &loader,
        tracker.as_mut().map(|t| t as &mut dyn MetricsTracker),
    )?;

    let path = trainer.save_final()?;
    tracing::info!(path = %path.display(), "Training done");
    Ok(())
}
