//! Configuration parsing, validation and derived hyperparameters.
//!
//! A run is described by a [`FinetuneConfig`] loaded once from YAML. The
//! iteration-level numbers the training loop needs (accumulation factor,
//! iteration counts, warmup length) are derived exactly once into an
//! immutable [`Hyperparameters`] snapshot, and derivation fails before any
//! model or dataset is touched when the primary fields are inconsistent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};

/// Instruction used for the qualitative sample emitted during validation.
pub const DEFAULT_VALIDATION_INSTRUCTION: &str =
    "Recommend a movie for me to watch during the weekend and explain the reason.";

/// Main configuration for an adapter fine-tuning run.
///
/// # Example
///
/// ```rust
/// use adapter_tune_rs::FinetuneConfig;
///
/// # fn main() -> adapter_tune_rs::Result<()> {
/// let config = FinetuneConfig::from_preset("stablelm-3b")?;
/// config.validate()?;
///
/// let hparams = config.hyperparameters()?;
/// assert_eq!(hparams.gradient_accumulation_iters, 16);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinetuneConfig {
    /// Directory holding `train.jsonl`, `test.jsonl` and `config.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base checkpoint directory; its name selects the architecture.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Where adapter checkpoints are written.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Numeric precision. Resolved from `accelerator` when unset.
    #[serde(default)]
    pub precision: Option<Precision>,

    /// Run with the accelerator-specific strategy (fixed shapes, explicit step marks).
    #[serde(default)]
    pub accelerator: bool,

    /// Number of cooperating workers.
    #[serde(default = "default_devices")]
    pub devices: usize,

    /// Base random seed; each worker adds its rank.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Throughput monitoring.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Validation preview settings.
    #[serde(default)]
    pub validation: ValidationConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/alpaca")
}
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("checkpoints/stabilityai/stablelm-base-alpha-3b")
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("out/adapter/alpaca")
}
fn default_devices() -> usize {
    1
}
fn default_seed() -> u64 {
    1337
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            checkpoint_dir: default_checkpoint_dir(),
            out_dir: default_out_dir(),
            precision: None,
            accelerator: false,
            devices: default_devices(),
            seed: default_seed(),
            training: TrainingConfig::default(),
            monitor: MonitorConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Primary training hyperparameters, as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Validate every N optimizer steps.
    #[serde(default = "default_eval_interval")]
    pub eval_interval: usize,

    /// Save an adapter checkpoint every N optimizer steps.
    #[serde(default = "default_save_interval")]
    pub save_interval: usize,

    /// Number of validation batches per evaluation.
    #[serde(default = "default_eval_iters")]
    pub eval_iters: usize,

    /// Log every N iterations.
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,

    /// Peak learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Global batch size, split evenly across workers.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Examples per forward/backward pass.
    #[serde(default = "default_micro_batch_size")]
    pub micro_batch_size: usize,

    /// Number of training examples treated as one epoch.
    #[serde(default = "default_epoch_size")]
    pub epoch_size: usize,

    /// Number of epochs.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Decoupled weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,

    /// Schedule applied once warmup is over.
    #[serde(default)]
    pub lr_decay: LrDecay,
}

fn default_eval_interval() -> usize {
    60
}
fn default_save_interval() -> usize {
    10
}
fn default_eval_iters() -> usize {
    100
}
fn default_log_interval() -> usize {
    1
}
fn default_lr() -> f64 {
    9e-3
}
fn default_batch_size() -> usize {
    64
}
fn default_micro_batch_size() -> usize {
    4
}
fn default_epoch_size() -> usize {
    50_000
}
fn default_num_epochs() -> usize {
    5
}
fn default_weight_decay() -> f64 {
    0.02
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            eval_interval: default_eval_interval(),
            save_interval: default_save_interval(),
            eval_iters: default_eval_iters(),
            log_interval: default_log_interval(),
            learning_rate: default_lr(),
            batch_size: default_batch_size(),
            micro_batch_size: default_micro_batch_size(),
            epoch_size: default_epoch_size(),
            num_epochs: default_num_epochs(),
            weight_decay: default_weight_decay(),
            lr_decay: LrDecay::None,
        }
    }
}

/// Learning-rate behaviour after warmup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrDecay {
    /// Hold the peak rate.
    #[default]
    None,
    /// Cosine decay to `min_lr` over the remaining optimizer steps.
    Cosine {
        /// Floor of the decay.
        min_lr: f64,
    },
}

/// Unit used for the `time/*` metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Seconds.
    #[default]
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl TimeUnit {
    /// Factor converting seconds into this unit.
    #[must_use]
    pub fn divider(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 1.0 / 60.0,
            TimeUnit::Hours => 1.0 / (60.0 * 60.0),
            TimeUnit::Days => 1.0 / (60.0 * 60.0 * 24.0),
        }
    }
}

/// Speed monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Number of iterations in the rolling throughput window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Unit of the reported times.
    #[serde(default)]
    pub time_unit: TimeUnit,

    /// Device model used to look up peak FLOP/s (e.g. `"a100"`, `"h100 sxm"`).
    #[serde(default)]
    pub device_name: Option<String>,

    /// Draw a progress bar on the first worker.
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

fn default_window_size() -> usize {
    50
}
fn default_true() -> bool {
    true
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            time_unit: TimeUnit::Seconds,
            device_name: None,
            progress_bar: true,
        }
    }
}

/// Settings for the generation sample printed after each validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Instruction formatted into the prompt.
    #[serde(default = "default_instruction")]
    pub instruction: String,

    /// Optional input paired with the instruction.
    #[serde(default)]
    pub input: String,

    /// Tokens generated on top of the prompt.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Sampling temperature; `0.0` selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Restrict sampling to the `top_k` most likely tokens.
    #[serde(default)]
    pub top_k: Option<usize>,
}

fn default_instruction() -> String {
    DEFAULT_VALIDATION_INSTRUCTION.into()
}
fn default_max_new_tokens() -> usize {
    100
}
fn default_temperature() -> f64 {
    0.8
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            instruction: default_instruction(),
            input: String::new(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_k: None,
        }
    }
}

/// Numeric precision of a run.
///
/// `*-true` variants store and compute in the named type. `*-mixed` variants
/// keep parameters in `f32` and compute in the half type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// Full `f64`.
    #[serde(rename = "64-true")]
    Double,
    /// Full `f32`.
    #[serde(rename = "32-true")]
    Full,
    /// `f16` parameters and compute.
    #[serde(rename = "16-true")]
    Half,
    /// `bf16` parameters and compute.
    #[serde(rename = "bf16-true")]
    BHalf,
    /// `f32` parameters with `f16` compute.
    #[serde(rename = "16-mixed")]
    HalfMixed,
    /// `f32` parameters with `bf16` compute.
    #[serde(rename = "bf16-mixed")]
    BHalfMixed,
}

impl Precision {
    /// Precision used when none is configured.
    #[must_use]
    pub fn resolve(configured: Option<Precision>, accelerator: bool) -> Precision {
        match configured {
            Some(precision) => precision,
            None if accelerator => Precision::Full,
            None => Precision::Half,
        }
    }

    /// Textual form, as accepted in config files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::Double => "64-true",
            Precision::Full => "32-true",
            Precision::Half => "16-true",
            Precision::BHalf => "bf16-true",
            Precision::HalfMixed => "16-mixed",
            Precision::BHalfMixed => "bf16-mixed",
        }
    }

    /// Storage type of the frozen base parameters.
    #[must_use]
    pub fn param_dtype(self) -> DType {
        match self {
            Precision::Double => DType::F64,
            Precision::Full | Precision::HalfMixed | Precision::BHalfMixed => DType::F32,
            Precision::Half => DType::F16,
            Precision::BHalf => DType::BF16,
        }
    }

    /// Type activations are computed in.
    #[must_use]
    pub fn compute_dtype(self) -> DType {
        match self {
            Precision::Double => DType::F64,
            Precision::Full => DType::F32,
            Precision::Half | Precision::HalfMixed => DType::F16,
            Precision::BHalf | Precision::BHalfMixed => DType::BF16,
        }
    }

    /// `(param, compute)` dtypes for `device`. Half types fall back to `f32` on CPU.
    #[must_use]
    pub fn dtypes_for(self, device: &Device) -> (DType, DType) {
        let (param, compute) = (self.param_dtype(), self.compute_dtype());
        if device.is_cpu() && matches!(compute, DType::F16 | DType::BF16) {
            tracing::warn!(
                "precision {} is not supported on CPU; computing in 32-true instead",
                self.as_str()
            );
            return (DType::F32, DType::F32);
        }
        (param, compute)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "64-true" | "64" => Ok(Precision::Double),
            "32-true" | "32" => Ok(Precision::Full),
            "16-true" => Ok(Precision::Half),
            "bf16-true" => Ok(Precision::BHalf),
            "16-mixed" | "16" => Ok(Precision::HalfMixed),
            "bf16-mixed" | "bf16" => Ok(Precision::BHalfMixed),
            other => Err(FinetuneError::Config(format!("unknown precision: {other}"))),
        }
    }
}

/// Immutable per-run hyperparameters, derived once from [`TrainingConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperparameters {
    /// Peak learning rate.
    pub learning_rate: f64,
    /// Per-worker batch size.
    pub batch_size: usize,
    /// Examples per forward/backward pass.
    pub micro_batch_size: usize,
    /// Micro-batches summed into one optimizer step.
    pub gradient_accumulation_iters: usize,
    /// Examples per epoch.
    pub epoch_size: usize,
    /// Number of epochs.
    pub num_epochs: usize,
    /// Total iterations (micro-batches) per worker.
    pub max_iters: usize,
    /// Optimizer steps spent ramping the learning rate.
    pub warmup_iters: usize,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    /// Schedule after warmup.
    pub lr_decay: LrDecay,
    /// Validate every N optimizer steps.
    pub eval_interval: usize,
    /// Save every N optimizer steps.
    pub save_interval: usize,
    /// Validation batches per evaluation.
    pub eval_iters: usize,
    /// Log every N iterations.
    pub log_interval: usize,
}

impl Hyperparameters {
    /// Derive the snapshot for a run on `devices` workers.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] when the batch does not split evenly
    /// across workers or micro-batches, when any interval is zero, or when the
    /// run would contain no iterations.
    ///
    /// # Example
    ///
    /// ```rust
    /// use adapter_tune_rs::config::{Hyperparameters, TrainingConfig};
    ///
    /// let training = TrainingConfig { batch_size: 6, micro_batch_size: 4, ..Default::default() };
    /// assert!(Hyperparameters::derive(&training, 1).is_err());
    /// ```
    pub fn derive(training: &TrainingConfig, devices: usize) -> Result<Self> {
        if devices == 0 {
            return Err(FinetuneError::Config("devices must be > 0".into()));
        }
        if training.micro_batch_size == 0 {
            return Err(FinetuneError::Config("micro_batch_size must be > 0".into()));
        }
        if training.batch_size % devices != 0 {
            return Err(FinetuneError::Config(format!(
                "batch_size {} does not split evenly across {devices} devices",
                training.batch_size
            )));
        }
        let batch_size = training.batch_size / devices;
        if batch_size % training.micro_batch_size != 0 {
            return Err(FinetuneError::Config(format!(
                "per-device batch size {batch_size} is not a multiple of micro_batch_size {}",
                training.micro_batch_size
            )));
        }
        let gradient_accumulation_iters = batch_size / training.micro_batch_size;
        if gradient_accumulation_iters == 0 {
            return Err(FinetuneError::Config(format!(
                "gradient_accumulation_iters must be > 0 (batch_size {batch_size}, micro_batch_size {})",
                training.micro_batch_size
            )));
        }

        for (name, value) in [
            ("eval_interval", training.eval_interval),
            ("save_interval", training.save_interval),
            ("log_interval", training.log_interval),
            ("eval_iters", training.eval_iters),
        ] {
            if value == 0 {
                return Err(FinetuneError::Config(format!("{name} must be > 0")));
            }
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(FinetuneError::Config("learning_rate must be positive".into()));
        }
        if training.weight_decay < 0.0 {
            return Err(FinetuneError::Config("weight_decay must be >= 0".into()));
        }

        let iters_per_epoch = training.epoch_size / training.micro_batch_size;
        let max_iters = training.num_epochs * iters_per_epoch / devices;
        if max_iters == 0 {
            return Err(FinetuneError::Config(format!(
                "max_iters computes to zero (epoch_size {}, num_epochs {}, micro_batch_size {}, devices {devices})",
                training.epoch_size, training.num_epochs, training.micro_batch_size
            )));
        }
        let warmup_iters = 2 * iters_per_epoch / devices;

        Ok(Self {
            learning_rate: training.learning_rate,
            batch_size,
            micro_batch_size: training.micro_batch_size,
            gradient_accumulation_iters,
            epoch_size: training.epoch_size,
            num_epochs: training.num_epochs,
            max_iters,
            warmup_iters,
            weight_decay: training.weight_decay,
            lr_decay: training.lr_decay,
            eval_interval: training.eval_interval,
            save_interval: training.save_interval,
            eval_iters: training.eval_iters,
            log_interval: training.log_interval,
        })
    }

    /// Number of optimizer steps the run will take.
    #[must_use]
    pub fn optimizer_steps(&self) -> usize {
        self.max_iters / self.gradient_accumulation_iters
    }
}

impl FinetuneConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"stablelm-3b"` - StableLM base alpha 3B on Alpaca, one device
    /// - `"pythia-410m"` - Pythia 410M on Alpaca, one device
    /// - `"stablelm-3b-accelerator"` - StableLM 3B on eight accelerator cores
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "stablelm-3b" => Ok(Self::default()),
            "pythia-410m" => Ok(Self::pythia_410m_preset()),
            "stablelm-3b-accelerator" => Ok(Self::stablelm_3b_accelerator_preset()),
            _ => Err(FinetuneError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Pythia 410M with a smaller global batch.
    #[must_use]
    pub fn pythia_410m_preset() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints/EleutherAI/pythia-410m"),
            out_dir: PathBuf::from("out/adapter/alpaca-pythia-410m"),
            training: TrainingConfig {
                batch_size: 32,
                micro_batch_size: 8,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// StableLM 3B spread over eight accelerator cores.
    #[must_use]
    pub fn stablelm_3b_accelerator_preset() -> Self {
        Self {
            accelerator: true,
            devices: 8,
            precision: Some(Precision::Full),
            out_dir: PathBuf::from("out/adapter/alpaca-accelerator"),
            ..Default::default()
        }
    }

    /// Precision after applying the accelerator default.
    #[must_use]
    pub fn precision(&self) -> Precision {
        Precision::resolve(self.precision, self.accelerator)
    }

    /// Derive the hyperparameter snapshot for this configuration.
    ///
    /// # Errors
    ///
    /// See [`Hyperparameters::derive`].
    pub fn hyperparameters(&self) -> Result<Hyperparameters> {
        Hyperparameters::derive(&self.training, self.devices)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("data_dir", &self.data_dir),
            ("checkpoint_dir", &self.checkpoint_dir),
            ("out_dir", &self.out_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(FinetuneError::Config(format!("{name} is required")));
            }
        }
        if self.out_dir.file_name().is_none() {
            return Err(FinetuneError::Config(
                "out_dir must end in a named directory".into(),
            ));
        }
        if self.monitor.window_size == 0 {
            return Err(FinetuneError::Config("monitor.window_size must be > 0".into()));
        }
        if !(self.validation.temperature.is_finite() && self.validation.temperature >= 0.0) {
            return Err(FinetuneError::Config(
                "validation.temperature must be >= 0".into(),
            ));
        }
        if self.validation.top_k == Some(0) {
            return Err(FinetuneError::Config("validation.top_k must be > 0".into()));
        }
        self.hyperparameters()?;
        Ok(())
    }
}
