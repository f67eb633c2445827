//! Gradient accumulation across micro-batches.
//!
//! Each micro-batch's backward pass produces a fresh [`GradStore`]. The
//! accumulator sums the trainable parameters' entries in `f32`, keyed by
//! parameter name, until the training loop takes the total for an optimizer
//! step. Losses are scaled by `1 / gradient_accumulation_iters` before
//! backward, so the sum is the group mean.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};

use crate::error::Result;

/// Running per-parameter gradient sums.
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    sums: BTreeMap<String, Tensor>,
    micro_steps: usize,
}

impl GradientAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the gradients `grads` holds for `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if a gradient cannot be converted or added.
    pub fn accumulate(&mut self, params: &[(String, Var)], grads: &GradStore) -> Result<()> {
        for (name, var) in params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32)?.detach();
            let sum = match self.sums.remove(name) {
                Some(sum) => (sum + grad)?,
                None => grad,
            };
            self.sums.insert(name.clone(), sum);
        }
        self.micro_steps += 1;
        Ok(())
    }

    /// Micro-batches folded in since the last take.
    #[must_use]
    pub fn micro_steps(&self) -> usize {
        self.micro_steps
    }

    /// Whether nothing has been accumulated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.micro_steps == 0
    }

    /// Remove and return the sums, leaving the accumulator zeroed.
    pub fn take(&mut self) -> BTreeMap<String, Tensor> {
        self.micro_steps = 0;
        std::mem::take(&mut self.sums)
    }

    /// Drop an unfinished group. Returns how many micro-batches it held.
    pub fn discard(&mut self) -> usize {
        let dropped = self.micro_steps;
        self.sums.clear();
        self.micro_steps = 0;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn param() -> (String, Var) {
        let var = Var::from_tensor(&Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap()).unwrap();
        ("w".to_string(), var)
    }

    #[test]
    fn test_sums_across_micro_batches() {
        let params = vec![param()];
        let mut acc = GradientAccumulator::new();
        for scale in [1.0, 3.0] {
            let loss = (params[0].1.as_tensor().sum_all().unwrap() * scale).unwrap();
            acc.accumulate(&params, &loss.backward().unwrap()).unwrap();
        }
        assert_eq!(acc.micro_steps(), 2);

        let sums = acc.take();
        assert_eq!(sums["w"].to_vec1::<f32>().unwrap(), vec![4.0, 4.0]);
        assert!(acc.is_empty());
        assert!(acc.take().is_empty());
    }

    #[test]
    fn test_discard_drops_partial_group() {
        let params = vec![param()];
        let mut acc = GradientAccumulator::new();
        let loss = params[0].1.as_tensor().sum_all().unwrap();
        acc.accumulate(&params, &loss.backward().unwrap()).unwrap();
        assert_eq!(acc.discard(), 1);
        assert!(acc.is_empty());
        assert!(acc.take().is_empty());
    }
}
