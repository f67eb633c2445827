//! Text encoding for the validation preview.

use std::path::Path;

use serde_json::Value;

use crate::checkpoint::{TOKENIZER_CONFIG_FILE, TOKENIZER_FILE};
use crate::error::{FinetuneError, Result};

/// Turns text into token ids and back.
pub trait TextCodec: Send + Sync {
    /// Token ids of `text`, with a BOS token when the codec adds one.
    ///
    /// # Errors
    ///
    /// Fails when the underlying tokenizer rejects the text.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Text of `ids`, special tokens skipped.
    ///
    /// # Errors
    ///
    /// Fails when an id is outside the vocabulary.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// End-of-sequence id, if the vocabulary has one.
    fn eos_id(&self) -> Option<u32>;
}

/// A `tokenizer.json` tokenizer plus the BOS/EOS rules of `tokenizer_config.json`.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
    add_bos: bool,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .field("add_bos", &self.add_bos)
            .finish()
    }
}

// Special tokens appear either as a plain string or as `{"content": ...}`.
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_owned),
        _ => None,
    }
}

impl HfTokenizer {
    /// Load `tokenizer.json` and `tokenizer_config.json` from a checkpoint directory.
    ///
    /// # Errors
    ///
    /// Fails when either file is missing or malformed.
    pub fn from_checkpoint_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let tokenizer_file = dir.join(TOKENIZER_FILE);
        if !tokenizer_file.exists() {
            return Err(FinetuneError::Tokenizer(
                format!("{TOKENIZER_FILE} not found in {}", dir.display()).into(),
            ));
        }
        let inner = tokenizers::Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| FinetuneError::Tokenizer(format!("Failed to load tokenizer: {e}").into()))?;

        let config_file = dir.join(TOKENIZER_CONFIG_FILE);
        let config: Value = match std::fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("{} not found; no BOS/EOS handling", config_file.display());
                Value::Null
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self::with_config(inner, &config))
    }

    /// Wrap an in-memory tokenizer, reading special tokens from `config`.
    #[must_use]
    pub fn with_config(inner: tokenizers::Tokenizer, config: &Value) -> Self {
        let bos_id = special_token(config, "bos_token").and_then(|t| inner.token_to_id(&t));
        let eos_id = special_token(config, "eos_token").and_then(|t| inner.token_to_id(&t));
        let add_bos = config
            .get("add_bos_token")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            inner,
            bos_id,
            eos_id,
            add_bos,
        }
    }

    /// Vocabulary size, added tokens included.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl TextCodec for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false)?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if self.add_bos {
            if let Some(bos) = self.bos_id {
                ids.push(bos);
            }
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }
}
