//! Training loop and run orchestration.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use indicatif::{ProgressBar, ProgressStyle};

use crate::accumulate::GradientAccumulator;
use crate::adapter::adapter_filter;
use crate::adapter_gpt::AdapterGpt;
use crate::checkpoint::{
    check_valid_checkpoint_dir, load_adapter_checkpoint, load_base_checkpoint, periodic_checkpoint_name,
    save_adapter_checkpoint, BASE_CHECKPOINT_FILE, FINAL_ADAPTER_FILE,
};
use crate::config::{FinetuneConfig, Hyperparameters};
use crate::data::{load_splits, BatchSampler, DataConfig, Dataset};
use crate::error::{FinetuneError, Result};
use crate::flops::{estimate_flops, measure_flops};
use crate::logger::StepCsvLogger;
use crate::loss::loss_fn;
use crate::model::{AdapterModel, ModelConfig};
use crate::optimizer::{AdamWOptimizer, OptimizerConfig};
use crate::scheduler::LRScheduler;
use crate::speed_monitor::SpeedMonitor;
use crate::strategy::Strategy;
use crate::tokenizer::{HfTokenizer, TextCodec};
use crate::validation::{ValidationOutcome, Validator};

// Keeps the validation sampler's stream apart from the training sampler's.
const VALIDATION_STREAM: u64 = 1 << 32;

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Iterations (micro-batches) run by this worker.
    pub iterations: usize,
    /// Optimizer steps taken.
    pub optimizer_steps: usize,
    /// Tokens fed to the model by this worker, padding included.
    pub tokens: usize,
    /// Unscaled loss of every iteration.
    pub losses: Vec<f64>,
    /// Validation loss at every eval point, the initial sanity check excluded.
    pub val_losses: Vec<f64>,
    /// Periodic adapter checkpoints, in the order they were written.
    pub checkpoints: Vec<PathBuf>,
    /// The adapter checkpoint written after the loop.
    pub final_checkpoint: PathBuf,
}

/// Drives one worker through `max_iters` iterations.
///
/// The trainer owns the model, the optimizer over the adapter parameters
/// this worker updates, and the samplers. Base parameters are never handed
/// to the optimizer.
pub struct Trainer<'a, M: AdapterModel> {
    model: M,
    hparams: Hyperparameters,
    strategy: Strategy,
    params: Vec<(String, Var)>,
    optimizer: AdamWOptimizer,
    scheduler: LRScheduler,
    accumulator: GradientAccumulator,
    sampler: BatchSampler,
    validator: Validator<'a>,
    monitor: SpeedMonitor,
    out_dir: PathBuf,
    max_seq_length: usize,
    progress_bar: bool,
    step_count: usize,
}

impl<'a, M: AdapterModel> Trainer<'a, M> {
    /// Prepare a trainer for `model`, whose base weights are already loaded.
    ///
    /// Every worker ends up with rank 0's adapter initialization.
    ///
    /// # Errors
    ///
    /// Fails when the optimizer cannot be built or replicas cannot be synchronized.
    pub fn new(
        model: M,
        config: &FinetuneConfig,
        hparams: Hyperparameters,
        strategy: Strategy,
        codec: &'a dyn TextCodec,
        max_seq_length: usize,
        monitor: SpeedMonitor,
    ) -> Result<Self> {
        strategy.setup_model(&model)?;
        let params = model.trainable_parameters()?;
        if params.is_empty() {
            return Err(FinetuneError::Training("model has no trainable parameters".into()));
        }

        let optimizer = OptimizerConfig {
            learning_rate: hparams.learning_rate,
            weight_decay: hparams.weight_decay,
            ..OptimizerConfig::default()
        }
        .build_adamw(strategy.owned_parameters(&params))?;
        let scheduler = LRScheduler::from_hyperparameters(&hparams);
        tracing::debug!(
            "Rank {}: AdamW over {} of {} adapter tensors",
            strategy.rank(),
            optimizer.num_vars(),
            params.len()
        );

        let seed = strategy.seed_for(config.seed);
        let device = model.device().clone();
        let mut sampler = BatchSampler::new(hparams.micro_batch_size, seed, device.clone());
        let mut val_sampler = BatchSampler::new(hparams.micro_batch_size, seed + VALIDATION_STREAM, device);
        if strategy.fixed_shape() {
            sampler = sampler.with_fixed_length(max_seq_length);
            val_sampler = val_sampler.with_fixed_length(max_seq_length);
        }
        let validator = Validator::new(codec, config.validation.clone(), hparams.eval_iters, val_sampler, seed);

        Ok(Self {
            model,
            hparams,
            strategy,
            params,
            optimizer,
            scheduler,
            accumulator: GradientAccumulator::new(),
            sampler,
            validator,
            monitor,
            out_dir: config.out_dir.clone(),
            max_seq_length,
            progress_bar: config.monitor.progress_bar,
            step_count: 0,
        })
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// This worker's strategy.
    #[must_use]
    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Give the model back.
    pub fn into_model(self) -> M {
        self.model
    }

    /// Run the full training loop and save the final adapter checkpoint.
    ///
    /// # Errors
    ///
    /// Any sampling, forward, optimizer, collective, or I/O error aborts the run.
    pub fn train(&mut self, train_data: &Dataset, val_data: &Dataset) -> Result<TrainingSummary> {
        let hp = self.hparams.clone();
        let block_size = self.model.config().block_size;
        let world_size = self.strategy.world_size();

        self.validator.validate(&mut self.model, val_data, &self.strategy)?;

        let estimated_flops = estimate_flops(&self.model, block_size)? * hp.micro_batch_size as f64;
        self.strategy.print(format!(
            "Estimated TFLOPs: {:.2}",
            estimated_flops * world_size as f64 / 1e12
        ));
        let measured_flops = if self.strategy.supports_flop_measurement() {
            let measured = measure_flops(&self.model, hp.micro_batch_size, block_size)?;
            self.strategy.print(format!(
                "Measured TFLOPs: {:.2}",
                measured * world_size as f64 / 1e12
            ));
            Some(measured)
        } else {
            None
        };

        let progress = if self.progress_bar && self.strategy.is_global_zero() {
            let pb = ProgressBar::new(hp.max_iters as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        let mut summary = TrainingSummary {
            iterations: hp.max_iters,
            ..TrainingSummary::default()
        };
        let mut tokens_seen = 0usize;
        let mut eval_secs = 0.0;
        let total_t0 = Instant::now();
        self.strategy.mark_step()?;

        for iter_num in 0..hp.max_iters {
            self.scheduler.apply(self.step_count, &mut self.optimizer);
            let iter_t0 = Instant::now();

            let batch = self.sampler.sample(train_data)?;
            let (rows, seq_len) = batch.dims()?;
            let is_accumulating = (iter_num + 1) % hp.gradient_accumulation_iters != 0;

            let logits = self.model.forward(&batch.input_ids, Some(self.max_seq_length))?;
            let loss = loss_fn(&logits, &batch.targets)?;
            let grads = (&loss / hp.gradient_accumulation_iters as f64)?.backward()?;
            self.accumulator.accumulate(&self.params, &grads)?;
            let loss_value = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
            summary.losses.push(loss_value);

            if !is_accumulating {
                self.optimizer_step(grads)?;
                self.step_count += 1;
            }
            self.strategy.mark_step()?;

            let iter_ms = iter_t0.elapsed().as_secs_f64() * 1000.0;
            tokens_seen += rows * seq_len;
            self.monitor.on_train_batch_end(
                (iter_num + 1) * hp.micro_batch_size,
                total_t0.elapsed().as_secs_f64() - eval_secs,
                world_size,
                Some(estimated_flops),
                measured_flops,
                Some(tokens_seen),
            )?;
            if iter_num % hp.log_interval == 0 {
                self.strategy.print(format!(
                    "iter {iter_num} step {}: loss {loss_value:.4}, train time: {iter_ms:.2}ms{}",
                    self.step_count,
                    if is_accumulating { "" } else { " (optimizer.step)" }
                ));
            }
            if let Some(pb) = &progress {
                pb.set_message(format!("loss {loss_value:.4}"));
                pb.inc(1);
            }

            if !is_accumulating && self.step_count % hp.eval_interval == 0 {
                let t0 = Instant::now();
                let outcome = self.validator.validate(&mut self.model, val_data, &self.strategy)?;
                let secs = t0.elapsed().as_secs_f64();
                self.monitor.eval_end(secs);
                eval_secs += secs;
                self.strategy.print(format!(
                    "step {iter_num}: val loss {:.4}, val time: {:.2}ms",
                    outcome.loss,
                    secs * 1000.0
                ));
                summary.val_losses.push(outcome.loss);
                self.strategy.barrier();
            }
            if !is_accumulating && self.step_count % hp.save_interval == 0 {
                let path = self.out_dir.join(periodic_checkpoint_name(iter_num));
                self.save_adapter(&path)?;
                summary.checkpoints.push(path);
            }
        }

        let dropped = self.accumulator.discard();
        if dropped > 0 {
            tracing::warn!(
                "Discarding {dropped} micro-batches of an unfinished accumulation group"
            );
        }
        if let Some(pb) = progress {
            pb.finish_with_message("Training complete");
        }

        let final_checkpoint = self.out_dir.join(FINAL_ADAPTER_FILE);
        self.save_adapter(&final_checkpoint)?;
        summary.tokens = tokens_seen;
        summary.optimizer_steps = self.step_count;
        summary.final_checkpoint = final_checkpoint;
        Ok(summary)
    }

    // Folds the accumulated group into `store`, averages it across workers,
    // steps this worker's parameters and shares the result.
    fn optimizer_step(&mut self, mut store: GradStore) -> Result<()> {
        let mut grads = self.accumulator.take();
        self.strategy.sync_gradients(&mut grads, &self.params)?;
        for (name, var) in &self.params {
            match grads.remove(name) {
                Some(grad) => {
                    store.insert(var.as_tensor(), grad.to_dtype(var.dtype())?);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }
        self.optimizer.step(&store)?;
        self.strategy.gather_parameters(&self.params)
    }

    fn save_adapter(&self, path: &Path) -> Result<()> {
        let saved = if self.strategy.is_global_zero() {
            self.strategy
                .print(format!("Saving adapter weights to {}", path.display()));
            save_adapter_checkpoint(&self.model, path, adapter_filter).map(|_| ())
        } else {
            Ok(())
        };
        self.strategy.barrier();
        saved
    }
}

/// Build the adapter model described by `config` and load its base weights.
///
/// Returns the model and the sequence cap from the data directory.
///
/// # Errors
///
/// Fails on an incomplete checkpoint directory, an unknown architecture, or
/// a base checkpoint that does not fit the architecture.
pub fn load_model(config: &FinetuneConfig, strategy: &Strategy) -> Result<(AdapterGpt, usize)> {
    check_valid_checkpoint_dir(&config.checkpoint_dir)?;
    let model_config = ModelConfig::from_checkpoint_dir(&config.checkpoint_dir)?;
    let checkpoint_path = config.checkpoint_dir.join(BASE_CHECKPOINT_FILE);
    strategy.print(format!(
        "Loading model {} with {model_config:?}",
        checkpoint_path.display()
    ));

    let (param_dtype, compute_dtype) = config.precision().dtypes_for(strategy.device());
    let mut model = AdapterGpt::new(&model_config, param_dtype, compute_dtype, strategy.device())?;
    load_base_checkpoint(&mut model, &checkpoint_path)?;
    strategy.print(format!(
        "Number of trainable parameters: {}",
        model.num_parameters(true)?
    ));

    let max_seq_length = DataConfig::from_data_dir(&config.data_dir)?.max_seq_length_or(model_config.block_size);
    Ok((model, max_seq_length))
}

/// Fine-tune with the tokenizer shipped in the checkpoint directory.
///
/// # Errors
///
/// See [`fit_with_codec`].
pub fn fit(config: &FinetuneConfig, strategy: Strategy) -> Result<TrainingSummary> {
    let codec = HfTokenizer::from_checkpoint_dir(&config.checkpoint_dir)?;
    fit_with_codec(config, strategy, &codec)
}

/// Run one worker's share of a fine-tuning job.
///
/// Rank 0 creates the output directory, owns the CSV step log, and writes
/// every checkpoint.
///
/// # Errors
///
/// Configuration problems are reported before any data or weights are read.
pub fn fit_with_codec(config: &FinetuneConfig, strategy: Strategy, codec: &dyn TextCodec) -> Result<TrainingSummary> {
    config.validate()?;
    let hparams = config.hyperparameters()?;
    strategy.print(format!("{hparams:?}"));

    let out_name = config
        .out_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FinetuneError::Config(format!("cannot name {}", config.out_dir.display())))?;
    let logger = if strategy.is_global_zero() {
        std::fs::create_dir_all(&config.out_dir)?;
        let root = config.out_dir.parent().unwrap_or_else(|| Path::new("."));
        Some(StepCsvLogger::new(root, out_name)?)
    } else {
        None
    };
    let monitor = SpeedMonitor::from_config(logger, config.precision(), &config.monitor);
    strategy.barrier();

    let (train_data, val_data) = load_splits(&config.data_dir)?;
    let (model, max_seq_length) = load_model(config, &strategy)?;

    let train_t0 = Instant::now();
    let mut trainer = Trainer::new(model, config, hparams, strategy, codec, max_seq_length, monitor)?;
    let summary = trainer.train(&train_data, &val_data)?;
    trainer
        .strategy()
        .print(format!("Training time: {:.2}s", train_t0.elapsed().as_secs_f64()));
    Ok(summary)
}

/// One validation pass over the test split, optionally with trained adapters.
///
/// # Errors
///
/// Fails when the model, adapters, or data cannot be loaded.
pub fn evaluate(
    config: &FinetuneConfig,
    adapter_path: Option<&Path>,
    strategy: &Strategy,
    codec: &dyn TextCodec,
) -> Result<ValidationOutcome> {
    config.validate()?;
    let hparams = config.hyperparameters()?;
    let (_, val_data) = load_splits(&config.data_dir)?;
    let (mut model, max_seq_length) = load_model(config, strategy)?;
    if let Some(path) = adapter_path {
        let loaded = load_adapter_checkpoint(&mut model, path)?;
        strategy.print(format!("Loaded {loaded} adapter tensors from {}", path.display()));
    }

    let seed = strategy.seed_for(config.seed) + VALIDATION_STREAM;
    let mut sampler = BatchSampler::new(hparams.micro_batch_size, seed, strategy.device().clone());
    if strategy.fixed_shape() {
        sampler = sampler.with_fixed_length(max_seq_length);
    }
    let mut validator = Validator::new(codec, config.validation.clone(), hparams.eval_iters, sampler, seed);
    validator.validate(&mut model, &val_data, strategy)
}
