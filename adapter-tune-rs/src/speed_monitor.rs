//! Rolling-window throughput and utilization metrics.
//!
//! The training loop reports cumulative counters once per iteration. Rates
//! are computed over the last `window_size` iterations, so nothing is
//! reported until the window has filled.

use std::collections::{BTreeMap, VecDeque};

use crate::config::{MonitorConfig, Precision, TimeUnit};
use crate::error::Result;
use crate::flops::peak_flops;
use crate::logger::StepCsvLogger;

/// Tracks training speed and logs one metrics row per iteration.
#[derive(Debug)]
pub struct SpeedMonitor {
    logger: Option<StepCsvLogger>,
    peak_flops: Option<f64>,
    divider: f64,
    capacity: usize,
    history_samples: VecDeque<usize>,
    history_lengths: VecDeque<usize>,
    history_wct: VecDeque<f64>,
    history_e_flops: VecDeque<f64>,
    history_m_flops: VecDeque<f64>,
    total_eval_wct: f64,
    step: usize,
}

fn push_bounded<T>(deque: &mut VecDeque<T>, capacity: usize, value: T) {
    if deque.len() == capacity {
        deque.pop_front();
    }
    deque.push_back(value);
}

impl SpeedMonitor {
    /// Create a monitor over a window of `window_size` iterations.
    ///
    /// `device_name` selects the peak FLOP/s used for utilization; an unknown
    /// or missing name disables the `mfu` metrics.
    #[must_use]
    pub fn new(
        logger: Option<StepCsvLogger>,
        precision: Precision,
        window_size: usize,
        time_unit: TimeUnit,
        device_name: Option<&str>,
    ) -> Self {
        let peak = device_name.and_then(|name| {
            let peak = peak_flops(name, precision);
            if peak.is_none() {
                tracing::warn!("No peak FLOP/s known for device {name:?} at {precision}; utilization will not be reported");
            }
            peak
        });
        // One extra slot: rates are differences between the oldest and newest entry.
        let capacity = window_size.max(1) + 1;
        Self {
            logger,
            peak_flops: peak,
            divider: time_unit.divider(),
            capacity,
            history_samples: VecDeque::with_capacity(capacity),
            history_lengths: VecDeque::with_capacity(capacity),
            history_wct: VecDeque::with_capacity(capacity),
            history_e_flops: VecDeque::with_capacity(capacity),
            history_m_flops: VecDeque::with_capacity(capacity),
            total_eval_wct: 0.0,
            step: 0,
        }
    }

    /// Monitor built from the `monitor` section of a config.
    #[must_use]
    pub fn from_config(logger: Option<StepCsvLogger>, precision: Precision, config: &MonitorConfig) -> Self {
        Self::new(
            logger,
            precision,
            config.window_size,
            config.time_unit,
            config.device_name.as_deref(),
        )
    }

    /// Peak FLOP/s of one device, if known.
    #[must_use]
    pub fn peak_flops(&self) -> Option<f64> {
        self.peak_flops
    }

    /// Rows reported so far.
    #[must_use]
    pub fn step(&self) -> usize {
        self.step
    }

    /// Add the duration of one validation pass, in seconds.
    pub fn eval_end(&mut self, eval_elapsed: f64) {
        self.total_eval_wct += eval_elapsed;
    }

    /// Record the end of one training iteration and return this row's metrics.
    ///
    /// * `samples` - samples seen so far by this worker
    /// * `train_elapsed` - seconds of training so far, validation excluded
    /// * `world_size` - number of workers, each assumed to match this one
    /// * `estimated_flops` / `measured_flops` - FLOPs of one micro-batch on one worker
    /// * `lengths` - tokens seen so far by this worker
    ///
    /// # Errors
    ///
    /// Returns an error only if the attached CSV logger fails to write.
    pub fn on_train_batch_end(
        &mut self,
        samples: usize,
        train_elapsed: f64,
        world_size: usize,
        estimated_flops: Option<f64>,
        measured_flops: Option<f64>,
        lengths: Option<usize>,
    ) -> Result<BTreeMap<String, f64>> {
        let mut metrics: BTreeMap<String, f64> = BTreeMap::new();
        let world = world_size.max(1) as f64;
        let capacity = self.capacity;

        push_bounded(&mut self.history_samples, capacity, samples);
        if let Some(lengths) = lengths {
            push_bounded(&mut self.history_lengths, capacity, lengths);
        }
        push_bounded(&mut self.history_wct, capacity, train_elapsed);

        let window_full = self.history_wct.len() == capacity;
        let elapsed_wct = match (self.history_wct.front(), self.history_wct.back()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        };

        if window_full && elapsed_wct > 0.0 {
            let elapsed_batches = (self.history_samples.len() - 1) as f64;
            let elapsed_samples = (self.history_samples[self.history_samples.len() - 1]
                - self.history_samples[0]) as f64;
            let samples_per_sec = elapsed_samples * world / elapsed_wct;
            let dev_samples_per_sec = elapsed_samples / elapsed_wct;
            metrics.insert("throughput/batches_per_sec".into(), elapsed_batches * world / elapsed_wct);
            metrics.insert("throughput/samples_per_sec".into(), samples_per_sec);
            metrics.insert("throughput/device/batches_per_sec".into(), elapsed_batches / elapsed_wct);
            metrics.insert("throughput/device/samples_per_sec".into(), dev_samples_per_sec);

            // Token rates need a length for every sample entry in the window.
            if lengths.is_some() && self.history_lengths.len() == self.history_samples.len() {
                let elapsed_lengths =
                    (self.history_lengths[self.history_lengths.len() - 1] - self.history_lengths[0]) as f64;
                metrics.insert("throughput/tokens_per_sec".into(), elapsed_lengths * world / elapsed_wct);
                metrics.insert("throughput/device/tokens_per_sec".into(), elapsed_lengths / elapsed_wct);
            }
        }

        let peak = self.peak_flops;
        for (kind, per_batch) in [("estimated", estimated_flops), ("measured", measured_flops)] {
            let history = if kind == "estimated" {
                &mut self.history_e_flops
            } else {
                &mut self.history_m_flops
            };
            if let Some(flops) = per_batch {
                push_bounded(history, capacity, flops * world);
            }
            if history.len() == capacity && elapsed_wct > 0.0 {
                // The oldest entry marks the window start; its work happened before it.
                let elapsed_flops: f64 = history.iter().skip(1).sum();
                let flops_per_sec = elapsed_flops / elapsed_wct;
                let device_flops_per_sec = flops_per_sec / world;
                metrics.insert(format!("throughput/{kind}_flops_per_sec"), flops_per_sec);
                metrics.insert(format!("throughput/device/{kind}_flops_per_sec"), device_flops_per_sec);
                if let Some(peak) = peak {
                    metrics.insert(format!("throughput/device/{kind}_mfu"), device_flops_per_sec / peak);
                }
            }
        }

        metrics.insert("time/train".into(), train_elapsed * self.divider);
        metrics.insert("time/val".into(), self.total_eval_wct * self.divider);
        metrics.insert(
            "time/total".into(),
            (train_elapsed + self.total_eval_wct) * self.divider,
        );
        metrics.insert("samples".into(), samples as f64);

        if let Some(logger) = self.logger.as_mut() {
            logger.log_metrics(&metrics, self.step)?;
        }
        self.step += 1;
        Ok(metrics)
    }
}
