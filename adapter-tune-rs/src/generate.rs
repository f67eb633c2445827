//! Autoregressive sampling for the validation preview.
//!
//! There is no KV cache: every step reruns the model on the (cropped)
//! context. Generation only runs a few hundred tokens per validation, so the
//! quadratic cost does not matter.

use candle_core::{DType, IndexOp, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;

use crate::error::{FinetuneError, Result};
use crate::model::AdapterModel;

/// Sampling settings of one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Stop once the sequence, prompt included, reaches this length.
    pub max_returned_tokens: usize,
    /// Longest context fed to the model; capped by the block size.
    pub max_seq_length: Option<usize>,
    /// Softmax temperature; `0.0` picks the most likely token.
    pub temperature: f64,
    /// Sample only among the `top_k` most likely tokens.
    pub top_k: Option<usize>,
    /// Stop after emitting this token.
    pub eos_id: Option<u32>,
}

/// Lazily generated tokens following a prompt.
///
/// Yields each new token id, ending at `max_returned_tokens`, at EOS (which
/// is yielded), or after the first error.
pub struct Generation<'a, M: AdapterModel + ?Sized> {
    model: &'a M,
    config: GenerationConfig,
    context_limit: usize,
    tokens: Vec<u32>,
    rng: &'a mut StdRng,
    finished: bool,
}

impl<'a, M: AdapterModel + ?Sized> Generation<'a, M> {
    /// Start generating after `prompt`.
    ///
    /// # Errors
    ///
    /// Fails when the prompt is empty or already `max_returned_tokens` long.
    pub fn new(model: &'a M, prompt: &[u32], config: GenerationConfig, rng: &'a mut StdRng) -> Result<Self> {
        if prompt.is_empty() {
            return Err(FinetuneError::Model("cannot generate from an empty prompt".into()));
        }
        if config.max_returned_tokens <= prompt.len() {
            return Err(FinetuneError::Model(format!(
                "max_returned_tokens {} must exceed the prompt length {}",
                config.max_returned_tokens,
                prompt.len()
            )));
        }
        let block_size = model.config().block_size;
        let context_limit = config.max_seq_length.map_or(block_size, |m| m.min(block_size));
        Ok(Self {
            model,
            config,
            context_limit,
            tokens: prompt.to_vec(),
            rng,
            finished: false,
        })
    }

    /// Prompt plus everything generated so far.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    fn next_logits(&self) -> Result<Vec<f32>> {
        let start = self.tokens.len().saturating_sub(self.context_limit);
        let context = &self.tokens[start..];
        let idx = Tensor::new(context, self.model.device())?.unsqueeze(0)?;
        let logits = self.model.forward(&idx, Some(self.context_limit))?;
        let vocab_size = self.model.config().vocab_size;
        // Padded vocabulary rows are never valid tokens.
        let last = logits
            .i((0, context.len() - 1))?
            .narrow(0, 0, vocab_size)?
            .to_dtype(DType::F32)?;
        Ok(last.to_vec1::<f32>()?)
    }

    fn step(&mut self) -> Result<u32> {
        let logits = self.next_logits()?;
        let next = sample(&logits, self.config.temperature, self.config.top_k, self.rng)?;
        self.tokens.push(next);
        Ok(next)
    }
}

impl<M: AdapterModel + ?Sized> Iterator for Generation<'_, M> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.tokens.len() >= self.config.max_returned_tokens {
            return None;
        }
        match self.step() {
            Ok(token) => {
                if Some(token) == self.config.eos_id {
                    self.finished = true;
                }
                Some(Ok(token))
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Generate after `prompt` and return prompt plus generated tokens.
///
/// # Errors
///
/// See [`Generation::new`]; forward errors are propagated.
pub fn generate<M: AdapterModel + ?Sized>(
    model: &M,
    prompt: &[u32],
    config: GenerationConfig,
    rng: &mut StdRng,
) -> Result<Vec<u32>> {
    let mut tokens = prompt.to_vec();
    for token in Generation::new(model, prompt, config, rng)? {
        tokens.push(token?);
    }
    Ok(tokens)
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map_or(0, |(i, _)| i as u32)
}

/// Pick the next token from one row of logits.
///
/// # Errors
///
/// Fails when no token has a finite, positive probability.
pub fn sample(logits: &[f32], temperature: f64, top_k: Option<usize>, rng: &mut StdRng) -> Result<u32> {
    if temperature <= 0.0 {
        return Ok(argmax(logits));
    }
    let mut scaled: Vec<f32> = logits.iter().map(|&l| l / temperature as f32).collect();

    if let Some(k) = top_k {
        if k < scaled.len() {
            let mut sorted = scaled.clone();
            sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            let threshold = sorted[k.max(1) - 1];
            for l in &mut scaled {
                if *l < threshold {
                    *l = f32::NEG_INFINITY;
                }
            }
        }
    }

    let max = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let weights: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| FinetuneError::Model(format!("cannot sample from logits: {e}")))?;
    Ok(dist.sample(rng) as u32)
}
