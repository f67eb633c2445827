//! Learning rate schedules keyed by optimizer step count.

use crate::config::{Hyperparameters, LrDecay};
use crate::optimizer::AdamWOptimizer;

/// Learning rate scheduler types.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerType {
    /// Linear warmup, then the rate is left where warmup put it.
    Warmup {
        /// Number of warmup steps
        warmup_steps: usize,
    },
    /// Linear warmup, then cosine annealing to `min_lr`.
    WarmupCosine {
        /// Number of warmup steps
        warmup_steps: usize,
        /// Total number of optimizer steps
        total_steps: usize,
        /// Floor of the decay
        min_lr: f64,
    },
}

/// Learning rate scheduler.
#[derive(Debug, Clone)]
pub struct LRScheduler {
    /// Scheduler type
    scheduler_type: SchedulerType,
    /// Base learning rate
    base_lr: f64,
}

impl LRScheduler {
    /// Create a new scheduler.
    #[must_use]
    pub fn new(scheduler_type: SchedulerType, base_lr: f64) -> Self {
        Self {
            scheduler_type,
            base_lr,
        }
    }

    /// Scheduler for a run.
    #[must_use]
    pub fn from_hyperparameters(hparams: &Hyperparameters) -> Self {
        let scheduler_type = match hparams.lr_decay {
            LrDecay::None => SchedulerType::Warmup {
                warmup_steps: hparams.warmup_iters,
            },
            LrDecay::Cosine { min_lr } => SchedulerType::WarmupCosine {
                warmup_steps: hparams.warmup_iters,
                total_steps: hparams.optimizer_steps(),
                min_lr,
            },
        };
        Self::new(scheduler_type, hparams.learning_rate)
    }

    /// Rate for `step_count`, or `None` when the optimizer should keep its current rate.
    ///
    /// During warmup (`step_count <= warmup_steps`) the rate is
    /// `base_lr * step_count / warmup_steps`, reaching `base_lr` exactly at the
    /// last warmup step.
    #[must_use]
    pub fn lr_at(&self, step_count: usize) -> Option<f64> {
        let warmup_steps = match self.scheduler_type {
            SchedulerType::Warmup { warmup_steps } | SchedulerType::WarmupCosine { warmup_steps, .. } => {
                warmup_steps
            }
        };
        if step_count <= warmup_steps {
            if warmup_steps == 0 {
                return Some(self.base_lr);
            }
            return Some(self.base_lr * step_count as f64 / warmup_steps as f64);
        }

        match self.scheduler_type {
            SchedulerType::Warmup { .. } => None,
            SchedulerType::WarmupCosine {
                warmup_steps,
                total_steps,
                min_lr,
            } => {
                let span = total_steps.saturating_sub(warmup_steps).max(1);
                let progress = ((step_count - warmup_steps) as f64 / span as f64).min(1.0);
                let cosine_decay = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                Some(min_lr + (self.base_lr - min_lr) * cosine_decay)
            }
        }
    }

    /// Set the optimizer's rate for `step_count`, if the schedule prescribes one.
    pub fn apply(&self, step_count: usize, optimizer: &mut AdamWOptimizer) {
        if let Some(lr) = self.lr_at(step_count) {
            optimizer.set_learning_rate(lr);
        }
    }
}
