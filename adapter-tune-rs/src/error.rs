//! Error types for adapter-tune-rs.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`FinetuneError`]. Library errors from candle, serde, tokenizers and the CSV
//! writer convert automatically through `?`.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use adapter_tune_rs::{FinetuneConfig, FinetuneError};
//!
//! # fn main() {
//! match FinetuneConfig::from_preset("invalid-preset") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(FinetuneError::Config(msg)) => {
//!         eprintln!("Configuration error: {}", msg);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

use thiserror::Error;

/// Result type alias for adapter-tune-rs operations.
///
/// # Example
///
/// ```rust
/// use adapter_tune_rs::{FinetuneConfig, Result};
///
/// fn load_and_validate(path: &str) -> Result<FinetuneConfig> {
///     let config = FinetuneConfig::from_file(path)?;
///     config.validate()?;
///     Ok(config)
/// }
/// ```
pub type Result<T> = std::result::Result<T, FinetuneError>;

/// Errors that can occur while preparing or running a fine-tuning job.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FinetuneError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Model construction or forward error.
    #[error("model error: {0}")]
    Model(String),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Collective communication between workers failed.
    #[error("distributed error: {0}")]
    Distributed(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Step log writer error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for FinetuneError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        FinetuneError::Template(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for FinetuneError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        FinetuneError::Checkpoint(err.to_string())
    }
}
