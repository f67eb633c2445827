//! Shared attention utilities for the GPT-NeoX decoder.
//!
//! This module contains:
//! - [`RopeCache`], the precomputed rotary tables
//! - partial rotary application for heads that rotate only a prefix
//! - the additive causal mask and an attention softmax with a detached maximum

use candle_core::{DType, Device, Tensor, D};

use crate::error::Result;

/// Precomputed rotary embedding tables of shape `(block_size, n_elem)`.
#[derive(Debug, Clone)]
pub struct RopeCache {
    /// Cosine table.
    pub cos: Tensor,
    /// Sine table.
    pub sin: Tensor,
    n_elem: usize,
}

impl RopeCache {
    /// Build tables for `n_elem` rotated dimensions over `block_size` positions.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn new(block_size: usize, n_elem: usize, base: f64, device: &Device) -> Result<Self> {
        let theta: Vec<f32> = (0..n_elem)
            .step_by(2)
            .map(|i| (1.0 / base.powf(i as f64 / n_elem as f64)) as f32)
            .collect();
        let half = theta.len();
        let theta = Tensor::from_vec(theta, (1, half), device)?;
        let positions = Tensor::arange(0u32, block_size as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((block_size, 1))?;
        let idx_theta = positions.matmul(&theta)?;
        // Both halves of the rotated slice share the same angle.
        let idx_theta = Tensor::cat(&[&idx_theta, &idx_theta], D::Minus1)?;
        Ok(Self {
            cos: idx_theta.cos()?,
            sin: idx_theta.sin()?,
            n_elem,
        })
    }

    /// Number of rotated dimensions per head.
    #[must_use]
    pub fn n_elem(&self) -> usize {
        self.n_elem
    }

    /// `(cos, sin)` for the first `seq_len` positions, in `dtype`.
    ///
    /// # Errors
    ///
    /// Returns error if `seq_len` exceeds the table.
    pub fn tables(&self, seq_len: usize, dtype: DType) -> Result<(Tensor, Tensor)> {
        Ok((
            self.cos.narrow(0, 0, seq_len)?.to_dtype(dtype)?,
            self.sin.narrow(0, 0, seq_len)?.to_dtype(dtype)?,
        ))
    }
}

fn rotate(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let n = x.dim(D::Minus1)?;
    let half = n / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    Ok((x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?)?)
}

/// Rotate the first `n_elem` dimensions of every head of `x` `(b, nh, t, hs)`.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn apply_partial_rope(x: &Tensor, cos: &Tensor, sin: &Tensor, n_elem: usize) -> Result<Tensor> {
    let head_size = x.dim(D::Minus1)?;
    if n_elem == 0 {
        return Ok(x.clone());
    }
    let roped = rotate(&x.narrow(D::Minus1, 0, n_elem)?.contiguous()?, cos, sin)?;
    if n_elem == head_size {
        return Ok(roped);
    }
    let pass = x.narrow(D::Minus1, n_elem, head_size - n_elem)?;
    Ok(Tensor::cat(&[&roped, &pass], D::Minus1)?.contiguous()?)
}

/// Additive causal mask `(t, t)`: zero on and below the diagonal, `-inf` above.
///
/// # Errors
///
/// Returns error if tensor creation fails.
pub fn causal_mask(t: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..t)
        .flat_map(|i| (0..t).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (t, t), device)?.to_dtype(dtype)?)
}

/// Softmax over the last dimension, computed in `f32` and cast back.
///
/// The row maximum is detached; it cancels analytically and only serves
/// numerical range.
///
/// # Errors
///
/// Returns error if tensor operations fail.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let x = x.to_dtype(DType::F32)?;
    let max = x.max_keepdim(D::Minus1)?.detach();
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    Ok(exp.broadcast_div(&sum)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rope_position_zero_is_identity() {
        let device = Device::Cpu;
        let cache = RopeCache::new(8, 4, 10_000.0, &device).unwrap();
        let (cos, sin) = cache.tables(1, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 1, 6), &device).unwrap();
        let y = apply_partial_rope(&x, &cos, &sin, 4).unwrap();
        let diff = (y - &x).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_partial_rope_leaves_tail_untouched() {
        let device = Device::Cpu;
        let cache = RopeCache::new(8, 2, 10_000.0, &device).unwrap();
        let (cos, sin) = cache.tables(5, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 5, 6), &device).unwrap();
        let y = apply_partial_rope(&x, &cos, &sin, 2).unwrap();
        assert_eq!(y.dims(), x.dims());
        let tail_x = x.narrow(3, 2, 4).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let tail_y = y.narrow(3, 2, 4).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(tail_x, tail_y);
    }

    #[test]
    fn test_rope_preserves_norm() {
        let device = Device::Cpu;
        let cache = RopeCache::new(16, 4, 10_000.0, &device).unwrap();
        let (cos, sin) = cache.tables(16, DType::F32).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 1, 16, 4), &device).unwrap();
        let y = apply_partial_rope(&x, &cos, &sin, 4).unwrap();
        let nx = x.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        let ny = y.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((nx - ny).abs() < 1e-3);
    }

    #[test]
    fn test_masked_softmax_is_causal() {
        let device = Device::Cpu;
        let scores = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        let mask = causal_mask(3, DType::F32, &device).unwrap();
        let probs = softmax_last_dim(&scores.broadcast_add(&mask).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(probs[0], vec![1.0, 0.0, 0.0]);
        assert!((probs[1][0] - 0.5).abs() < 1e-6);
        assert!((probs[2].iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
