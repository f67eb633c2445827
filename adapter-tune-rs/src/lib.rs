//! # adapter-tune-rs
//!
//! Adapter fine-tuning of frozen causal language models on candle.
//!
//! A pretrained GPT-NeoX style checkpoint is loaded and frozen; each upper
//! block gets a small learned prompt and a zero-initialized per-head gate.
//! Only those adapter tensors are trained and saved.
//!
//! ## Features
//!
//! - **YAML Configuration** - One config file, validated before any weights are read
//! - **Gradient accumulation** - Micro-batches summed into one optimizer step
//! - **Execution strategies** - Single device, sharded data parallel, or accelerator cores
//! - **Throughput monitoring** - Estimated and measured FLOPs, utilization, CSV step log
//! - **Adapter-only checkpoints** - Small safetensors files holding just the trained deltas
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting config
//! adapter-tune init config.yaml --preset pythia-410m
//!
//! # Validate configuration
//! adapter-tune validate config.yaml
//!
//! # Start training on four workers
//! adapter-tune train config.yaml --devices 4
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use adapter_tune_rs::strategy::{launch, StrategyKind};
//! use adapter_tune_rs::{fit, FinetuneConfig};
//!
//! # fn main() -> adapter_tune_rs::Result<()> {
//! let config = FinetuneConfig::from_file("config.yaml")?;
//! let kind = StrategyKind::select(config.devices, config.accelerator);
//! let summaries = launch(kind, config.devices, |strategy| fit(&config, strategy))?;
//! println!("{} optimizer steps", summaries[0].optimizer_steps);
//! # Ok(())
//! # }
//! ```
//!
//! ## Using Presets
//!
//! ```rust
//! use adapter_tune_rs::FinetuneConfig;
//!
//! # fn main() -> adapter_tune_rs::Result<()> {
//! let mut config = FinetuneConfig::from_preset("pythia-410m")?;
//! config.training.num_epochs = 1;
//! config.training.learning_rate = 3e-3;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod accumulate;
pub mod adapter;
pub mod adapter_gpt;
pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod data;
pub mod error;
pub mod flops;
pub mod generate;
mod gpt_common;
pub mod logger;
pub mod loss;
pub mod model;
pub mod normalization;
pub mod optimizer;
pub mod prompt;
pub mod scheduler;
pub mod speed_monitor;
pub mod strategy;
pub mod tokenizer;
pub mod trainer;
pub mod validation;

pub use adapter::adapter_filter;
pub use adapter_gpt::AdapterGpt;
pub use config::{FinetuneConfig, Hyperparameters, TrainingConfig};
pub use error::{FinetuneError, Result};
pub use model::{AdapterModel, ModelConfig};
pub use strategy::{Strategy, StrategyKind};
pub use trainer::{fit, fit_with_codec, Trainer, TrainingSummary};
