//! Model configuration and the contract the training loop relies on.
//!
//! The loop never touches layer internals. It needs a forward pass, a way to
//! switch between training and inference, the named parameter set split into
//! frozen and trainable parts, and a FLOP counter. [`AdapterModel`] captures
//! exactly that; [`crate::adapter_gpt::AdapterGpt`] is the implementation
//! shipped with the crate.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{FinetuneError, Result};
use crate::flops::FlopCounter;

/// File inside a checkpoint directory that overrides the named architecture.
pub const MODEL_CONFIG_FILE: &str = "lit_config.json";

/// Architecture of a GPT-NeoX style decoder with adapter prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture name.
    pub name: String,
    /// Maximum context length.
    pub block_size: usize,
    /// Tokenizer vocabulary size.
    pub vocab_size: usize,
    /// The embedding table is padded to a multiple of this.
    #[serde(default = "default_padding_multiple")]
    pub padding_multiple: usize,
    /// Explicit padded vocabulary size, overriding `padding_multiple`.
    #[serde(default)]
    pub padded_vocab_size: Option<usize>,
    /// Number of transformer blocks.
    pub n_layer: usize,
    /// Attention heads per block.
    pub n_head: usize,
    /// Embedding width.
    pub n_embd: usize,
    /// Fraction of each head that receives rotary embeddings.
    #[serde(default = "default_rotary_percentage")]
    pub rotary_percentage: f64,
    /// Attention and MLP read the same input and are summed.
    #[serde(default = "default_true")]
    pub parallel_residual: bool,
    /// Linear layers carry biases.
    #[serde(default = "default_true")]
    pub bias: bool,
    /// MLP hidden width; `4 * n_embd` when unset.
    #[serde(default)]
    pub intermediate_size: Option<usize>,
    /// Layer norm epsilon.
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    /// Rotary base.
    #[serde(default = "default_rope_base")]
    pub rope_base: f64,
    /// Learned prompt tokens per adapted block.
    #[serde(default = "default_adapter_prompt_length")]
    pub adapter_prompt_length: usize,
    /// First block that receives an adapter.
    #[serde(default = "default_adapter_start_layer")]
    pub adapter_start_layer: usize,
}

fn default_padding_multiple() -> usize {
    512
}
fn default_rotary_percentage() -> f64 {
    0.25
}
fn default_true() -> bool {
    true
}
fn default_norm_eps() -> f64 {
    1e-5
}
fn default_rope_base() -> f64 {
    10_000.0
}
fn default_adapter_prompt_length() -> usize {
    10
}
fn default_adapter_start_layer() -> usize {
    2
}

impl ModelConfig {
    fn base(name: &str, block_size: usize, padding_multiple: usize, n_layer: usize, n_head: usize, n_embd: usize) -> Self {
        Self {
            name: name.into(),
            block_size,
            vocab_size: 50_254,
            padding_multiple,
            padded_vocab_size: None,
            n_layer,
            n_head,
            n_embd,
            rotary_percentage: default_rotary_percentage(),
            parallel_residual: true,
            bias: true,
            intermediate_size: None,
            norm_eps: default_norm_eps(),
            rope_base: default_rope_base(),
            adapter_prompt_length: default_adapter_prompt_length(),
            adapter_start_layer: default_adapter_start_layer(),
        }
    }

    /// Look up a named architecture.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Model`] for an unknown name.
    pub fn from_name(name: &str) -> Result<Self> {
        let config = match name {
            "pythia-70m" => Self::base(name, 2048, 128, 6, 8, 512),
            "pythia-160m" => Self::base(name, 2048, 128, 12, 12, 768),
            "pythia-410m" => Self::base(name, 2048, 128, 24, 16, 1024),
            "pythia-1b" => Self::base(name, 2048, 128, 16, 8, 2048),
            "stablelm-base-alpha-3b" | "stablelm-tuned-alpha-3b" => {
                Self::base(name, 4096, 512, 16, 32, 4096)
            }
            "stablelm-base-alpha-7b" | "stablelm-tuned-alpha-7b" => Self {
                padded_vocab_size: Some(50_432),
                ..Self::base(name, 4096, 256, 16, 48, 6144)
            },
            _ => return Err(FinetuneError::Model(format!("unknown model name: {name}"))),
        };
        Ok(config)
    }

    /// Resolve the architecture of a checkpoint directory.
    ///
    /// A `lit_config.json` inside the directory wins; otherwise the
    /// directory name is looked up with [`ModelConfig::from_name`].
    ///
    /// # Errors
    ///
    /// Returns an error when neither source yields a configuration.
    pub fn from_checkpoint_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let override_path = dir.join(MODEL_CONFIG_FILE);
        if override_path.exists() {
            let content = std::fs::read_to_string(&override_path)?;
            let config: Self = serde_json::from_str(&content)?;
            config.validate()?;
            return Ok(config);
        }
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| FinetuneError::Model(format!("cannot name {}", dir.display())))?;
        Self::from_name(name)
    }

    /// Check the dimensions fit together.
    ///
    /// # Errors
    ///
    /// Returns [`FinetuneError::Model`] describing the inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(FinetuneError::Model(format!(
                "n_embd {} is not divisible by n_head {}",
                self.n_embd, self.n_head
            )));
        }
        if self.rope_n_elem() % 2 != 0 {
            return Err(FinetuneError::Model(format!(
                "rotary dimensions {} must be even",
                self.rope_n_elem()
            )));
        }
        if self.padded_vocab_size() < self.vocab_size {
            return Err(FinetuneError::Model("padded_vocab_size < vocab_size".into()));
        }
        if self.block_size == 0 || self.n_layer == 0 {
            return Err(FinetuneError::Model("block_size and n_layer must be > 0".into()));
        }
        Ok(())
    }

    /// Embedding rows, padded for efficient matmuls.
    #[must_use]
    pub fn padded_vocab_size(&self) -> usize {
        self.padded_vocab_size.unwrap_or_else(|| {
            let multiple = self.padding_multiple.max(1);
            self.vocab_size.div_ceil(multiple) * multiple
        })
    }

    /// Width of one attention head.
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of head dimensions rotated by the positional embedding.
    #[must_use]
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size() as f64) as usize
    }

    /// MLP hidden width.
    #[must_use]
    pub fn intermediate_size(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.n_embd)
    }
}

/// Outcome of loading a state dict into a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters overwritten from the state dict.
    pub loaded: Vec<String>,
    /// Model parameters absent from the state dict.
    pub missing: Vec<String>,
    /// State-dict entries the model does not have.
    pub unexpected: Vec<String>,
}

/// What the training loop needs from a model.
pub trait AdapterModel {
    /// Architecture of the model.
    fn config(&self) -> &ModelConfig;

    /// Device holding the parameters.
    fn device(&self) -> &Device;

    /// Logits `(batch, seq, padded_vocab)` for `idx` of shape `(batch, seq)`.
    ///
    /// # Errors
    ///
    /// Fails when `seq` exceeds `max_seq_length` (the block size when `None`).
    fn forward(&self, idx: &Tensor, max_seq_length: Option<usize>) -> Result<Tensor>;

    /// Whether the model records autograd state for its trainable parameters.
    fn is_training(&self) -> bool;

    /// Switch between training and inference mode.
    fn set_training(&mut self, training: bool);

    /// Every parameter by name, sorted.
    ///
    /// # Errors
    ///
    /// Fails when the parameter store cannot be read.
    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>>;

    /// Parameters the optimizer may update, sorted by name.
    ///
    /// # Errors
    ///
    /// Fails when the parameter store cannot be read.
    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Overwrite parameters from `state`. Shape disagreements are errors;
    /// missing and unexpected names are reported, not rejected.
    ///
    /// # Errors
    ///
    /// Fails on a shape mismatch or a failed copy.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<LoadReport>;

    /// Counter fed by the forward pass.
    fn flop_counter(&self) -> &FlopCounter;

    /// Number of scalar parameters, optionally only the trainable ones.
    ///
    /// # Errors
    ///
    /// Fails when the parameter store cannot be read.
    fn num_parameters(&self, trainable_only: bool) -> Result<usize> {
        if trainable_only {
            Ok(self
                .trainable_parameters()?
                .iter()
                .map(|(_, v)| v.elem_count())
                .sum())
        } else {
            Ok(self
                .named_parameters()?
                .iter()
                .map(|(_, t)| t.elem_count())
                .sum())
        }
    }
}

/// Three-block model small enough for unit tests.
#[cfg(test)]
pub(crate) fn test_config() -> ModelConfig {
    ModelConfig {
        name: "tiny".into(),
        block_size: 16,
        vocab_size: 30,
        padding_multiple: 8,
        padded_vocab_size: None,
        n_layer: 3,
        n_head: 2,
        n_embd: 8,
        rotary_percentage: 0.5,
        parallel_residual: true,
        bias: true,
        intermediate_size: None,
        norm_eps: 1e-5,
        rope_base: 10_000.0,
        adapter_prompt_length: 3,
        adapter_start_layer: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_named_configs() {
        let config = ModelConfig::from_name("stablelm-base-alpha-3b").unwrap();
        assert_eq!(config.padded_vocab_size(), 50_688);
        assert_eq!(config.head_size(), 128);
        assert_eq!(config.rope_n_elem(), 32);
        assert_eq!(config.intermediate_size(), 4 * 4096);

        let pythia = ModelConfig::from_name("pythia-70m").unwrap();
        assert_eq!(pythia.padded_vocab_size(), 50_304);

        let seven = ModelConfig::from_name("stablelm-tuned-alpha-7b").unwrap();
        assert_eq!(seven.padded_vocab_size(), 50_432);

        assert!(ModelConfig::from_name("gpt-5").is_err());
    }

    #[test]
    fn test_all_named_configs_validate() {
        for name in [
            "pythia-70m",
            "pythia-160m",
            "pythia-410m",
            "pythia-1b",
            "stablelm-base-alpha-3b",
            "stablelm-base-alpha-7b",
            "stablelm-tuned-alpha-3b",
            "stablelm-tuned-alpha-7b",
        ] {
            ModelConfig::from_name(name).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn test_resolution_by_directory_name() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("pythia-160m");
        std::fs::create_dir(&dir).unwrap();
        let config = ModelConfig::from_checkpoint_dir(&dir).unwrap();
        assert_eq!(config.n_layer, 12);
    }

    #[test]
    fn test_resolution_prefers_config_file() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("pythia-160m");
        std::fs::create_dir(&dir).unwrap();
        let mut custom = ModelConfig::from_name("pythia-70m").unwrap();
        custom.name = "custom".into();
        custom.adapter_start_layer = 0;
        std::fs::write(
            dir.join(MODEL_CONFIG_FILE),
            serde_json::to_string(&custom).unwrap(),
        )
        .unwrap();

        let config = ModelConfig::from_checkpoint_dir(&dir).unwrap();
        assert_eq!(config, custom);
    }

    #[test]
    fn test_invalid_dimensions_rejected() {
        let mut config = ModelConfig::from_name("pythia-70m").unwrap();
        config.n_head = 7;
        assert!(config.validate().is_err());
    }
}
