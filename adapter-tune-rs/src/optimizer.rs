//! AdamW over the trainable adapter parameters.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW};

use crate::error::{FinetuneError, Result};

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 9e-3,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.02,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an AdamW optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build_adamw(&self, vars: Vec<Var>) -> Result<AdamWOptimizer> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        };

        let num_vars = vars.len();
        let opt = candle_nn::AdamW::new(vars, params)
            .map_err(|e| FinetuneError::Training(format!("Failed to create AdamW: {e}")))?;

        Ok(AdamWOptimizer {
            inner: opt,
            num_vars,
            steps: 0,
        })
    }
}

/// AdamW optimizer wrapper.
pub struct AdamWOptimizer {
    inner: candle_nn::AdamW,
    num_vars: usize,
    steps: usize,
}

impl AdamWOptimizer {
    /// Apply one update from `grads`. Variables without a gradient are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner
            .step(grads)
            .map_err(|e| FinetuneError::Training(format!("Optimizer step failed: {e}")))?;
        self.steps += 1;
        Ok(())
    }

    /// Get current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set learning rate (used by schedulers).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    /// Number of variables this optimizer updates.
    #[must_use]
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Updates applied so far.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_optimizer_config_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.learning_rate, 9e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
        assert_eq!(config.weight_decay, 0.02);
    }

    #[test]
    fn test_step_moves_against_gradient() -> Result<()> {
        let var = Var::from_tensor(&Tensor::new(&[1f32, -1.0], &Device::Cpu)?)?;
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = config.build_adamw(vec![var.clone()])?;
        assert_eq!(optimizer.num_vars(), 1);

        let loss = var.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        optimizer.step(&grads)?;

        let values = var.as_tensor().to_vec1::<f32>()?;
        assert!(values[0] < 1.0);
        assert!(values[1] > -1.0);
        assert_eq!(optimizer.steps(), 1);
        Ok(())
    }

    #[test]
    fn test_zero_learning_rate_leaves_values() -> Result<()> {
        let var = Var::zeros(3, DType::F32, &Device::Cpu)?;
        let mut optimizer = OptimizerConfig::default().build_adamw(vec![var.clone()])?;
        optimizer.set_learning_rate(0.0);
        assert_eq!(optimizer.learning_rate(), 0.0);

        let loss = (var.as_tensor() + 1.0)?.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        optimizer.step(&grads)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![0.0; 3]);
        Ok(())
    }
}
