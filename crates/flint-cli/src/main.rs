//! FLINT CLI: training pipeline for code-completion language models.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flint_core::{ExperimentConfig, Split};
use flint_data::TokenizerAdapter;
use flint_distributed::{ClusterConfig, DistributedContext, RingBackend};
use flint_trainer::{
    AdamOptions, BigramLm, LoggingCallback, MetricsJsonCallback, ProgressCallback, Trainer,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flint")]
#[command(author, version, about = "Code-completion model training pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train from a YAML configuration
    Train {
        /// Path to the training configuration file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Resume path; may contain a `{run_id}` placeholder
        #[arg(long)]
        resume: Option<String>,

        /// Run identifier (defaults to a timestamped id)
        #[arg(long)]
        run_id: Option<String>,

        /// Rank of this process (overrides the config)
        #[arg(long)]
        local_rank: Option<usize>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Write JSONL step metrics to this file
        #[arg(long)]
        metrics: Option<PathBuf>,
    },
    /// Evaluate a checkpoint on a held-out split
    Validate {
        /// Path to the training configuration file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint path; may contain a `{run_id}` placeholder
        #[arg(long)]
        checkpoint: String,

        /// Held-out split to evaluate
        #[arg(long, default_value = "val")]
        split: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run(Cli::parse()) {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Train {
            config,
            resume,
            run_id,
            local_rank,
            no_progress,
            metrics,
        } => train(config, resume, run_id, local_rank, no_progress, metrics),
        Commands::Validate {
            config,
            checkpoint,
            split,
        } => validate(config, checkpoint, &split),
    }
}

fn load_config(path: &PathBuf) -> Result<ExperimentConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config {}", path.display()))?;
    let config: ExperimentConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn build_trainer(
    config: ExperimentConfig,
    runtime: &tokio::runtime::Runtime,
) -> Result<Trainer<BigramLm>> {
    let tokenizer = Arc::new(TokenizerAdapter::from_file(
        &config.tokenizer.file,
        config.model.labels_pad,
    )?);

    let ctx = if config.distributed.world_size > 1 {
        let cluster = ClusterConfig::new(
            config.distributed.nodes.clone(),
            config.distributed.local_rank,
        );
        let backend = runtime
            .block_on(RingBackend::new(cluster))
            .context("cannot join the training ring")?;
        DistributedContext::new(Box::new(backend))
    } else {
        DistributedContext::local()
    };

    let model = BigramLm::new(
        tokenizer.vocab_size(),
        config.model.hidden_size,
        config.model.labels_pad,
        AdamOptions {
            eps: config.training.adam_eps,
            weight_decay: config.training.weight_decay,
            ..AdamOptions::default()
        },
        config.training.seed,
    );

    Ok(Trainer::new(
        config,
        model,
        tokenizer,
        ctx,
        runtime.handle().clone(),
    )?)
}

fn train(
    config_path: PathBuf,
    resume: Option<String>,
    run_id: Option<String>,
    local_rank: Option<usize>,
    no_progress: bool,
    metrics: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(resume) = resume {
        config.training.resume_from_checkpoint = Some(resume);
    }
    if let Some(run_id) = run_id {
        config.training.run_id = Some(run_id);
    }
    if let Some(rank) = local_rank {
        config.distributed.local_rank = rank;
    }
    config.validate()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let mut trainer = build_trainer(config, &runtime)?;

    trainer.add_callback(Box::new(LoggingCallback::new(10)));
    if !no_progress {
        trainer.add_callback(Box::new(ProgressCallback::new(trainer.planned_steps())));
    }
    if let Some(path) = metrics {
        trainer.add_callback(Box::new(MetricsJsonCallback::new(path)));
    }

    // Stop at the next batch boundary on ctrl-c; the in-flight batch
    // completes so the saved state stays consistent.
    let stop = trainer.stop_flag();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping after the current batch");
            stop.store(true, Ordering::SeqCst);
        }
    });

    trainer.run()?;
    Ok(())
}

fn validate(config_path: PathBuf, checkpoint: String, split: &str) -> Result<()> {
    let split = match split {
        "val" => Split::Val,
        "test" => Split::Test,
        other => anyhow::bail!("unknown split {other:?}; expected \"val\" or \"test\""),
    };
    let config = load_config(&config_path)?;
    let runtime = tokio::runtime::Runtime::new()?;
    let mut trainer = build_trainer(config, &runtime)?;

    let metrics = trainer.evaluate_only(Some(&checkpoint), split)?;
    println!(
        "{}_loss={:.6} perplexity={:.4} target_tokens={}",
        split.as_str(),
        metrics.loss,
        metrics.perplexity,
        metrics.target_tokens
    );
    Ok(())
}
