//! Held-out loss plus one generated sample.

use candle_core::DType;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ValidationConfig;
use crate::data::{BatchSampler, Dataset};
use crate::error::Result;
use crate::generate::{generate, GenerationConfig};
use crate::loss::loss_fn;
use crate::model::AdapterModel;
use crate::prompt::{generate_prompt, PromptRecord};
use crate::strategy::Strategy;
use crate::tokenizer::TextCodec;

/// Result of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    /// Mean loss over the sampled batches.
    pub loss: f64,
    /// Decoded prompt and continuation.
    pub sample: String,
}

/// Runs validation passes against a fixed held-out set.
///
/// Owns its own batch sampler and generation RNG so validating never shifts
/// the training sampler's stream.
pub struct Validator<'a> {
    codec: &'a dyn TextCodec,
    settings: ValidationConfig,
    eval_iters: usize,
    sampler: BatchSampler,
    rng: StdRng,
}

impl<'a> Validator<'a> {
    /// Validator averaging `eval_iters` batches drawn by `sampler`.
    #[must_use]
    pub fn new(
        codec: &'a dyn TextCodec,
        settings: ValidationConfig,
        eval_iters: usize,
        sampler: BatchSampler,
        seed: u64,
    ) -> Self {
        Self {
            codec,
            settings,
            eval_iters,
            sampler,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Evaluate `model` on `data` in inference mode, then restore its mode.
    ///
    /// # Errors
    ///
    /// Propagates sampling, forward, and tokenizer errors.
    pub fn validate<M: AdapterModel + ?Sized>(
        &mut self,
        model: &mut M,
        data: &Dataset,
        strategy: &Strategy,
    ) -> Result<ValidationOutcome> {
        strategy.print("Validating ...");
        let was_training = model.is_training();
        model.set_training(false);
        let outcome = self.run(model, data, strategy);
        model.set_training(was_training);
        outcome
    }

    fn run<M: AdapterModel + ?Sized>(&mut self, model: &M, data: &Dataset, strategy: &Strategy) -> Result<ValidationOutcome> {
        let mut losses = vec![0f64; self.eval_iters];
        for slot in &mut losses {
            let batch = self.sampler.sample(data)?;
            let logits = model.forward(&batch.input_ids, None)?;
            let loss = loss_fn(&logits, &batch.targets)?;
            *slot = f64::from(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?);
        }
        let loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };

        strategy.print(&self.settings.instruction);
        let record = PromptRecord::new(self.settings.instruction.clone(), self.settings.input.clone());
        let encoded = self.codec.encode(&generate_prompt(&record))?;
        let max_returned_tokens = encoded.len() + self.settings.max_new_tokens;
        let output = generate(
            model,
            &encoded,
            GenerationConfig {
                max_returned_tokens,
                max_seq_length: Some(max_returned_tokens),
                temperature: self.settings.temperature,
                top_k: self.settings.top_k,
                eos_id: self.codec.eos_id(),
            },
            &mut self.rng,
        )?;
        let sample = self.codec.decode(&output)?;
        strategy.print(&sample);

        Ok(ValidationOutcome { loss, sample })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter_gpt::AdapterGpt;
    use crate::data::TokenizedExample;
    use crate::model::test_config;
    use candle_core::Device;

    /// Maps every byte of the text to a token below 30.
    struct ByteCodec;

    impl TextCodec for ByteCodec {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().take(6).map(|b| u32::from(b) % 30).collect())
        }

        fn decode(&self, ids: &[u32]) -> Result<String> {
            Ok(ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" "))
        }

        fn eos_id(&self) -> Option<u32> {
            None
        }
    }

    fn dataset() -> Dataset {
        let examples = (0..4)
            .map(|i| TokenizedExample {
                input_ids: vec![1 + i, 2, 3, 4],
                labels: vec![-1, 2, 3, 4],
            })
            .collect();
        Dataset::from_examples(examples).unwrap()
    }

    #[test]
    fn test_validation_restores_training_mode() {
        let mut model = AdapterGpt::new(&test_config(), DType::F32, DType::F32, &Device::Cpu).unwrap();
        let settings = ValidationConfig {
            max_new_tokens: 4,
            ..Default::default()
        };
        let sampler = BatchSampler::new(2, 0, Device::Cpu);
        let mut validator = Validator::new(&ByteCodec, settings, 3, sampler, 0);
        let strategy = Strategy::single(Device::Cpu);

        assert!(model.is_training());
        let outcome = validator.validate(&mut model, &dataset(), &strategy).unwrap();
        assert!(model.is_training());
        assert!(outcome.loss.is_finite() && outcome.loss > 0.0);
        // Six prompt tokens plus four generated ones.
        assert_eq!(outcome.sample.split(' ').count(), 10);

        model.set_training(false);
        validator.validate(&mut model, &dataset(), &strategy).unwrap();
        assert!(!model.is_training());
    }

    #[test]
    fn test_validation_leaves_adapters_untouched() {
        let mut model = AdapterGpt::new(&test_config(), DType::F32, DType::F32, &Device::Cpu).unwrap();
        let before: Vec<Vec<f32>> = model
            .trainable_parameters()
            .unwrap()
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        let sampler = BatchSampler::new(2, 1, Device::Cpu);
        let settings = ValidationConfig {
            max_new_tokens: 2,
            ..Default::default()
        };
        let mut validator = Validator::new(&ByteCodec, settings, 2, sampler, 1);
        validator
            .validate(&mut model, &dataset(), &Strategy::single(Device::Cpu))
            .unwrap();
        let after: Vec<Vec<f32>> = model
            .trainable_parameters()
            .unwrap()
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        assert_eq!(before, after);
    }
}
