//! FLOP estimation, measurement, and device peak throughput.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use candle_core::{DType, Tensor};

use crate::config::Precision;
use crate::error::Result;
use crate::model::AdapterModel;

/// Counts the matmul FLOPs of a forward pass and the backward pass it implies.
///
/// Layers call [`FlopCounter::record`] unconditionally; nothing is counted
/// unless a measurement is in progress.
#[derive(Debug, Default)]
pub struct FlopCounter {
    active: AtomicBool,
    forward: AtomicU64,
    backward: AtomicU64,
}

/// Totals collected between [`FlopCounter::start`] and [`FlopCounter::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasuredFlops {
    /// Forward FLOPs.
    pub forward: u64,
    /// Backward FLOPs implied by the forward graph.
    pub backward: u64,
}

impl MeasuredFlops {
    /// Forward plus backward.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.forward + self.backward
    }
}

impl FlopCounter {
    /// Create an idle counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset and begin counting.
    pub fn start(&self) {
        self.forward.store(0, Ordering::Relaxed);
        self.backward.store(0, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    /// Stop counting and return the totals.
    pub fn stop(&self) -> MeasuredFlops {
        self.active.store(false, Ordering::Release);
        MeasuredFlops {
            forward: self.forward.load(Ordering::Relaxed),
            backward: self.backward.load(Ordering::Relaxed),
        }
    }

    /// Whether a measurement is in progress.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Add one operation's cost.
    pub fn record(&self, forward: u64, backward: u64) {
        if self.is_active() {
            self.forward.fetch_add(forward, Ordering::Relaxed);
            self.backward.fetch_add(backward, Ordering::Relaxed);
        }
    }
}

/// FLOPs of one sequence through a model holding `n_params` parameters.
#[must_use]
pub fn flops_per_param(max_seq_length: usize, n_layer: usize, n_embd: usize, n_params: usize) -> f64 {
    let seq = max_seq_length as f64;
    let flops_per_token = 2.0 * n_params as f64;
    let flops_per_seq = flops_per_token * seq;
    let attn_flops_per_seq = n_layer as f64 * 2.0 * 2.0 * (n_embd as f64 * seq * seq);
    flops_per_seq + attn_flops_per_seq
}

/// Analytic FLOPs for one sequence of `max_seq_length` tokens.
///
/// In training mode trainable parameters cost a forward and two backward
/// products, frozen ones a forward and one backward product; in inference
/// mode every parameter costs one forward product.
///
/// # Errors
///
/// Fails when the parameter store cannot be read.
pub fn estimate_flops<M: AdapterModel + ?Sized>(model: &M, max_seq_length: usize) -> Result<f64> {
    let config = model.config();
    let trainable = model.num_parameters(true)?;
    let frozen = model.num_parameters(false)?.saturating_sub(trainable);
    let trainable_flops = flops_per_param(max_seq_length, config.n_layer, config.n_embd, trainable);
    let frozen_flops = flops_per_param(max_seq_length, config.n_layer, config.n_embd, frozen);
    let (ops, frozen_ops) = if model.is_training() { (3.0, 2.0) } else { (1.0, 1.0) };
    Ok(ops * trainable_flops + frozen_ops * frozen_flops)
}

/// Count the FLOPs of one forward pass over a `(micro_batch_size, seq_len)`
/// batch of zeros, plus the backward pass when the model is training.
///
/// # Errors
///
/// Propagates forward errors.
pub fn measure_flops<M: AdapterModel + ?Sized>(
    model: &M,
    micro_batch_size: usize,
    seq_len: usize,
) -> Result<f64> {
    let x = Tensor::zeros((micro_batch_size, seq_len), DType::I64, model.device())?;
    let counter = model.flop_counter();
    counter.start();
    let forward = model.forward(&x, Some(seq_len));
    let measured = counter.stop();
    forward?;
    let total = if model.is_training() { measured.total() } else { measured.forward };
    Ok(total as f64)
}

struct PeakRow {
    pattern: &'static str,
    f64: Option<f64>,
    f32: Option<f64>,
    bf16: Option<f64>,
    f16: Option<f64>,
}

const fn row(pattern: &'static str, f64: Option<f64>, f32: Option<f64>, bf16: Option<f64>, f16: Option<f64>) -> PeakRow {
    PeakRow { pattern, f64, f32, bf16, f16 }
}

// Ordered most specific first. Names are lowercased with dashes turned to spaces.
const PEAK_FLOPS: &[PeakRow] = &[
    row("h100 sxm", Some(33.5e12), Some(66.9e12), Some(989.4e12), Some(989.4e12)),
    row("h100 pcie", Some(25.6e12), Some(51.2e12), Some(756e12), Some(756e12)),
    row("h100", Some(33.5e12), Some(66.9e12), Some(989.4e12), Some(989.4e12)),
    row("a100", Some(9.7e12), Some(19.5e12), Some(312e12), Some(312e12)),
    row("a6000", None, Some(38.7e12), Some(309.7e12), Some(309.7e12)),
    row("a40", None, Some(37.4e12), Some(149.7e12), Some(149.7e12)),
    row("a10g", None, Some(31.2e12), Some(125e12), Some(125e12)),
    row("l4", None, Some(30.3e12), Some(242e12), Some(242e12)),
    row("rtx 4090", None, Some(82.6e12), Some(165.2e12), Some(165.2e12)),
    row("v100s pcie", Some(8.2e12), Some(16.4e12), None, Some(130e12)),
    row("v100 pcie", Some(7e12), Some(14e12), None, Some(112e12)),
    row("v100", Some(7.8e12), Some(15.7e12), None, Some(125e12)),
    row("t4", None, Some(8.1e12), None, Some(65e12)),
    row("quadro rtx 5000", None, Some(11.2e12), None, Some(89.2e12)),
    row("tpu v5litepod", None, None, Some(197e12), None),
    row("tpu v4", None, None, Some(275e12), None),
    row("tpu v3", None, None, Some(123e12), None),
    row("tpu v2", None, None, Some(45e12), None),
];

/// Peak FLOP/s of one device at `precision`, when the device is known.
///
/// Accelerator cores only report a `bf16` peak, which serves every precision.
#[must_use]
pub fn peak_flops(device_name: &str, precision: Precision) -> Option<f64> {
    let name = device_name.to_lowercase().replace(['-', '_'], " ");
    let row = PEAK_FLOPS.iter().find(|row| name.contains(row.pattern))?;
    if row.pattern.starts_with("tpu") {
        return row.bf16;
    }
    match precision.compute_dtype() {
        DType::F64 => row.f64,
        DType::F32 => row.f32,
        DType::BF16 => row.bf16,
        DType::F16 => row.f16,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_only_counts_while_active() {
        let counter = FlopCounter::new();
        counter.record(10, 20);
        counter.start();
        counter.record(3, 6);
        counter.record(1, 0);
        let measured = counter.stop();
        counter.record(100, 100);
        assert_eq!(measured, MeasuredFlops { forward: 4, backward: 6 });
        assert_eq!(measured.total(), 10);
    }

    #[test]
    fn test_flops_per_param() {
        let flops = flops_per_param(4, 2, 8, 100);
        assert_eq!(flops, 2.0 * 100.0 * 4.0 + 2.0 * 4.0 * 8.0 * 16.0);
    }

    #[test]
    fn test_peak_flops_lookup() {
        assert_eq!(peak_flops("NVIDIA A100-SXM4-40GB", Precision::BHalfMixed), Some(312e12));
        assert_eq!(peak_flops("NVIDIA H100 PCIe", Precision::Full), Some(51.2e12));
        assert_eq!(peak_flops("Tesla V100S-PCIE-32GB", Precision::Full), Some(16.4e12));
        assert_eq!(peak_flops("Tesla T4", Precision::HalfMixed), Some(65e12));
        assert_eq!(peak_flops("Tesla T4", Precision::BHalf), None);
        assert_eq!(peak_flops("TPU v4", Precision::Full), Some(275e12));
        assert_eq!(peak_flops("cpu", Precision::Full), None);
    }
}
