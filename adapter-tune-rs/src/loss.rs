//! Next-token cross-entropy with label masking.

use candle_core::{DType, Tensor, D};

use crate::error::{FinetuneError, Result};

/// Target id excluded from the loss and its gradient.
pub const IGNORE_INDEX: i64 = -1;

/// Mean next-token cross-entropy over the non-ignored positions.
///
/// `logits` is `(batch, seq, vocab)` and `targets` is `(batch, seq)`. Position
/// `n` of the logits is scored against target `n + 1`. Targets equal to
/// [`IGNORE_INDEX`] are masked out. A batch with no scored position, including
/// one whose sequences are a single token long, yields a zero loss.
///
/// The loss is computed in `f32` regardless of the logits dtype and returned
/// as a rank-0 tensor that stays attached to the autograd graph.
///
/// # Errors
///
/// Returns [`FinetuneError::Training`] when the shapes disagree or a target
/// lies outside the vocabulary.
pub fn loss_fn(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, vocab) = logits.dims3()?;
    let (tb, tt) = targets.dims2()?;
    if (b, t) != (tb, tt) {
        return Err(FinetuneError::Training(format!(
            "logits {:?} and targets {:?} disagree",
            logits.dims(),
            targets.dims()
        )));
    }
    if t < 2 {
        return Ok(Tensor::new(0f32, logits.device())?);
    }

    let positions = b * (t - 1);
    let logits = logits
        .narrow(1, 0, t - 1)?
        .to_dtype(DType::F32)?
        .reshape((positions, vocab))?;
    let shifted = targets
        .narrow(1, 1, t - 1)?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;

    let mut mask = Vec::with_capacity(positions);
    let mut safe_targets = Vec::with_capacity(positions);
    for &target in &shifted {
        if target == IGNORE_INDEX {
            mask.push(0f32);
            safe_targets.push(0u32);
        } else {
            let idx = usize::try_from(target)
                .ok()
                .filter(|&idx| idx < vocab)
                .ok_or_else(|| {
                    FinetuneError::Training(format!(
                        "target id {target} is outside the vocabulary of {vocab}"
                    ))
                })?;
            mask.push(1f32);
            safe_targets.push(idx as u32);
        }
    }

    let device = logits.device();
    let valid = mask.iter().filter(|&&m| m > 0.0).count();
    if valid == 0 {
        return Ok(Tensor::new(0f32, device)?);
    }

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let index = Tensor::from_vec(safe_targets, (positions, 1), device)?;
    let picked = log_probs.gather(&index, 1)?.squeeze(1)?;
    let mask = Tensor::from_vec(mask, positions, device)?;

    let total = picked.mul(&mask)?.sum_all()?.neg()?;
    Ok((total / valid as f64)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let vocab = 11;
        let logits = Tensor::zeros((2, 5, vocab), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0i64, 3, 4, 5, 6], [1, 2, 7, 8, 9]], &Device::Cpu).unwrap();
        let loss = loss_fn(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - (vocab as f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ignored_positions_do_not_count() {
        let device = Device::Cpu;
        // The second position predicts target 2 perfectly; the third is ignored.
        let logits = Tensor::new(
            &[[[0f32, 0., 0.], [0., 0., 50.], [50., 0., 0.]]],
            &device,
        )
        .unwrap();
        let targets = Tensor::new(&[[IGNORE_INDEX, 1, 2]], &device).unwrap();
        let all = loss_fn(&logits, &targets).unwrap().to_scalar::<f32>().unwrap();

        let masked = Tensor::new(&[[IGNORE_INDEX, 1, IGNORE_INDEX]], &device).unwrap();
        let one = loss_fn(&logits, &masked).unwrap().to_scalar::<f32>().unwrap();
        assert!((one - 3f32.ln()).abs() < 1e-5);
        assert!((all - 3f32.ln() / 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_ignored_positions_have_zero_gradient() {
        let device = Device::Cpu;
        let init = Tensor::randn(0f32, 1.0, (2, 4, 6), &device).unwrap();
        let logits = Var::from_tensor(&init).unwrap();
        let targets = Tensor::new(
            &[[0i64, 1, IGNORE_INDEX, 3], [0, IGNORE_INDEX, IGNORE_INDEX, 5]],
            &device,
        )
        .unwrap();

        let loss = loss_fn(logits.as_tensor(), &targets).unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(logits.as_tensor()).unwrap().to_vec3::<f32>().unwrap();

        // logits[b, n] is scored against targets[b, n + 1].
        assert!(grad[0][1].iter().all(|&g| g == 0.0));
        assert!(grad[1][0].iter().all(|&g| g == 0.0));
        assert!(grad[1][1].iter().all(|&g| g == 0.0));
        // The final position never predicts anything.
        assert!(grad[0][3].iter().all(|&g| g == 0.0));
        assert!(grad[0][0].iter().any(|&g| g != 0.0));
        assert!(grad[1][2].iter().any(|&g| g != 0.0));
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let logits = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[IGNORE_INDEX; 3]], &Device::Cpu).unwrap();
        let loss = loss_fn(&logits, &targets).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_shape_mismatch_errors() {
        let logits = Tensor::zeros((1, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::zeros((1, 3), DType::I64, &Device::Cpu).unwrap();
        assert!(loss_fn(&logits, &targets).is_err());
    }

    #[test]
    fn test_single_token_sequences_score_nothing() {
        let logits = Tensor::ones((3, 1, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[2i64], [3], [4]], &Device::Cpu).unwrap();
        let loss = loss_fn(&logits, &targets).unwrap();
        assert_eq!(loss.dims(), &[] as &[usize]);
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_out_of_vocab_target_errors() {
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0i64, 7]], &Device::Cpu).unwrap();
        assert!(loss_fn(&logits, &targets).is_err());
    }
}
