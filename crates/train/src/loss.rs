//! Per-token cross-entropy and masked reduction.

use candle_core::{DType, Result, Tensor, D};

/// Unreduced cross-entropy: logits `(b, t, vocab)`, targets `(b, t)` → `(b, t)`.
///
/// Computed in `f32` via log-softmax + gather, whatever the logits dtype.
pub fn token_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let log_probs = candle_nn::ops::log_softmax(
        &logits.to_dtype(DType::F32)?.reshape((b * t, v))?,
        D::Minus1,
    )?;
    let index = targets.reshape((b * t, 1))?.to_dtype(DType::U32)?;
    log_probs.gather(&index, 1)?.neg()?.reshape((b, t))
}

/// `sum(loss · mask) / sum(mask) / accumulation_steps`, as a scalar tensor
/// that stays on the autograd graph.
///
/// `loss` and `mask` must have the same shape. An all-zero mask divides by
/// zero and yields a non-finite loss.
pub fn masked_loss(loss: &Tensor, mask: &Tensor, accumulation_steps: usize) -> Result<Tensor> {
    if accumulation_steps == 0 {
        candle_core::bail!("accumulation_steps must be >= 1");
    }
    let mask = mask.to_dtype(loss.dtype())?;
    let total = (loss * &mask)?.sum_all()?;
    let count = mask.sum_all()?;
    (total / count)? / accumulation_steps as f64
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn half_masked_row() {
        let l = Tensor::new(&[[1f32, 2., 3., 4.]], &Device::Cpu).unwrap();
        let m = Tensor::new(&[[1f32, 1., 0., 0.]], &Device::Cpu).unwrap();
        assert!((scalar(&masked_loss(&l, &m, 1).unwrap()) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn scales_inversely_with_accumulation() {
        let l = Tensor::new(&[[0.5f32, 1.5, 2.0], [3.0, 0.25, 4.0]], &Device::Cpu).unwrap();
        let m = Tensor::new(&[[1f32, 0., 1.], [1., 1., 0.]], &Device::Cpu).unwrap();
        let a2 = scalar(&masked_loss(&l, &m, 2).unwrap());
        let a4 = scalar(&masked_loss(&l, &m, 4).unwrap());
        assert!((a4 - a2 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn all_ones_mask_is_mean() {
        let l = Tensor::new(&[[1f32, 2., 3.], [4., 5., 6.]], &Device::Cpu).unwrap();
        let m = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let got = scalar(&masked_loss(&l, &m, 1).unwrap());
        let mean = scalar(&l.mean_all().unwrap());
        assert!((got - mean).abs() < 1e-6);
    }

    #[test]
    fn empty_mask_is_not_finite() {
        let l = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        let m = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(!scalar(&masked_loss(&l, &m, 1).unwrap()).is_finite());
    }

    #[test]
    fn zero_accumulation_is_an_error() {
        let l = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        assert!(masked_loss(&l, &l, 0).is_err());
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let l = Tensor::new(&[[1f32, 2.]], &Device::Cpu).unwrap();
        let m = Tensor::new(&[[1f32, 1., 1.]], &Device::Cpu).unwrap();
        assert!(masked_loss(&l, &m, 1).is_err());
    }

    #[test]
    fn cross_entropy_matches_candle_mean() {
        let logits = Tensor::randn(0f32, 1., (2, 3, 7), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 3, 6], [1, 2, 5]], &Device::Cpu).unwrap();
        let per_token = token_cross_entropy(&logits, &targets).unwrap();
        assert_eq!(per_token.dims(), &[2, 3]);

        let reference = candle_nn::loss::cross_entropy(
            &logits.reshape((6, 7)).unwrap(),
            &targets.reshape(6).unwrap(),
        )
        .unwrap();
        let ones = Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap();
        let ours = masked_loss(&per_token, &ones, 1).unwrap();
        assert!((scalar(&ours) - scalar(&reference)).abs() < 1e-5);
    }

    #[test]
    fn uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[4u32, 0]], &Device::Cpu).unwrap();
        let v: Vec<f32> = token_cross_entropy(&logits, &targets)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for x in v {
            assert!((x - 8f32.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn masked_positions_get_no_gradient() {
        let logits = Var::randn(0f32, 1., (1, 2, 5), &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 2]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 0.]], &Device::Cpu).unwrap();
        let loss = masked_loss(
            &token_cross_entropy(logits.as_tensor(), &targets).unwrap(),
            &mask,
            1,
        )
        .unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(logits.as_tensor()).unwrap();
        let masked_row = g.narrow(1, 1, 1).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(scalar(&masked_row), 0.0);
        let kept_row = g.narrow(1, 0, 1).unwrap().abs().unwrap().sum_all().unwrap();
        assert!(scalar(&kept_row) > 0.0);
    }
}
