//! Layer normalization built from differentiable primitives.
//!
//! The statistics are computed in `f32` and the result is cast back to the
//! input dtype before the affine transform, so half-precision activations keep
//! a stable mean and variance.
//!
//! # Example
//!
//! ```rust
//! use adapter_tune_rs::normalization::LayerNorm;
//! use candle_core::{DType, Device, Tensor};
//!
//! # fn main() -> adapter_tune_rs::Result<()> {
//! let device = Device::Cpu;
//! let weight = Tensor::ones(8, DType::F32, &device)?;
//! let bias = Tensor::zeros(8, DType::F32, &device)?;
//! let norm = LayerNorm::new(weight, bias, 1e-5);
//!
//! let x = Tensor::randn(0f32, 3.0, (2, 4, 8), &device)?;
//! let y = norm.forward(&x)?;
//! assert_eq!(y.dims(), x.dims());
//! # Ok(())
//! # }
//! ```

use candle_core::{DType, Tensor, D};

use crate::error::Result;

/// Layer normalization over the last dimension with a learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Wrap existing scale and shift tensors of shape `(hidden,)`.
    #[must_use]
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }

    /// Normalize `x` of shape `(..., hidden)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the last dimension does not match the weight.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x32 = x.to_dtype(DType::F32)?;
        let mean = x32.mean_keepdim(D::Minus1)?;
        let centered = x32.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        let normed = normed.to_dtype(dtype)?;
        let weight = self.weight.to_dtype(dtype)?;
        let bias = self.bias.to_dtype(dtype)?;
        Ok(normed.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }
}
