//! CLI entry point for adapter-tune.

use std::path::PathBuf;

use adapter_tune_rs::config::Precision;
use adapter_tune_rs::strategy::{launch, StrategyKind};
use adapter_tune_rs::tokenizer::HfTokenizer;
use adapter_tune_rs::trainer::{evaluate, fit};
use adapter_tune_rs::{FinetuneConfig, FinetuneError, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "adapter-tune")]
#[command(about = "Adapter fine-tuning of frozen causal language models")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file, optionally running one validation pass
    Validate {
        /// Path to configuration file
        config: PathBuf,
        /// Also load the model and report validation loss and a sample
        #[arg(long)]
        eval: bool,
        /// Adapter checkpoint to evaluate (implies --eval)
        #[arg(long)]
        adapter: Option<PathBuf>,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: PathBuf,
        /// Override the number of workers
        #[arg(long)]
        devices: Option<usize>,
        /// Use the accelerator strategy
        #[arg(long)]
        accelerator: bool,
        /// Override the precision (e.g. bf16-mixed, 32-true)
        #[arg(long)]
        precision: Option<Precision>,
        /// Override the output directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: PathBuf,
        /// Preset (stablelm-3b, pythia-410m, stablelm-3b-accelerator)
        #[arg(long, default_value = "stablelm-3b")]
        preset: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, eval, adapter } => {
            tracing::info!("Validating configuration: {}", config.display());
            let config = FinetuneConfig::from_file(&config)?;
            config.validate()?;
            let hparams = config.hyperparameters()?;
            println!("✓ Configuration is valid");
            println!("  Checkpoint: {}", config.checkpoint_dir.display());
            println!("  Data: {}", config.data_dir.display());
            println!("  Precision: {}", config.precision());
            println!(
                "  Iterations: {} ({} optimizer steps, accumulation {})",
                hparams.max_iters,
                hparams.optimizer_steps(),
                hparams.gradient_accumulation_iters
            );

            if eval || adapter.is_some() {
                let kind = StrategyKind::select(1, config.accelerator);
                let codec = HfTokenizer::from_checkpoint_dir(&config.checkpoint_dir)?;
                let outcome = launch(kind, 1, |strategy| evaluate(&config, adapter.as_deref(), &strategy, &codec))?
                    .into_iter()
                    .next()
                    .ok_or_else(|| FinetuneError::Training("validation produced no result".into()))?;
                println!("✓ Validation loss: {:.4}", outcome.loss);
                println!("{}", outcome.sample);
            }
        }
        Commands::Train {
            config,
            devices,
            accelerator,
            precision,
            out_dir,
        } => {
            tracing::info!("Starting training with config: {}", config.display());
            let mut config = FinetuneConfig::from_file(&config)?;
            if let Some(devices) = devices {
                config.devices = devices;
            }
            config.accelerator |= accelerator;
            if precision.is_some() {
                config.precision = precision;
            }
            if let Some(out_dir) = out_dir {
                config.out_dir = out_dir;
            }
            config.validate()?;

            let kind = StrategyKind::select(config.devices, config.accelerator);
            let summaries = launch(kind, config.devices, |strategy| fit(&config, strategy))?;
            if let Some(summary) = summaries.first() {
                println!(
                    "✓ Trained {} iterations ({} optimizer steps)",
                    summary.iterations, summary.optimizer_steps
                );
                println!("  Adapter saved to: {}", summary.final_checkpoint.display());
            }
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = FinetuneConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {}", output.display());
        }
    }

    Ok(())
}
