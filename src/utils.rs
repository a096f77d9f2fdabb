use candle::{DType, Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{Error, Result};

pub fn linspace(start: f64, stop: f64, steps: usize) -> Vec<f64> {
    if steps == 0 {
        vec![]
    } else if steps == 1 {
        vec![start]
    } else {
        let delta = (stop - start) / (steps - 1) as f64;
        (0..steps).map(|step| start + step as f64 * delta).collect()
    }
}

/// Draws standard-normal noise from an explicit random source. All noise in
/// the pipeline goes through here so that fixed-seed runs are reproducible.
pub fn randn<S: Into<Shape>, R: Rng + ?Sized>(
    shape: S,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let samples = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(samples, shape, device)?)
}

pub fn randn_like<R: Rng + ?Sized>(tensor: &Tensor, rng: &mut R) -> Result<Tensor> {
    Ok(randn(tensor.shape().clone(), tensor.device(), rng)?.to_dtype(tensor.dtype())?)
}

/// Linearly-interpolated quantile of a sorted slice, following the same
/// convention as `torch.quantile`.
fn quantile_sorted(sorted: &[f32], q: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0] as f64;
    }
    let pos = q * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] as f64 * (1. - frac) + sorted[hi] as f64 * frac
}

/// Dynamic thresholding: rescale a predicted clean sample by the
/// `percentile`-quantile of its own absolute values, computed per batch
/// element over all non-batch dimensions. The divisor is floored at 1 so
/// that in-range predictions pass through untouched.
pub fn dynamic_threshold(x0: &Tensor, percentile: f64) -> Result<Tensor> {
    if !(0. ..=1.).contains(&percentile) || percentile == 0. {
        return Err(Error::config(format!(
            "percentile must lie in (0, 1], got {percentile}"
        )));
    }
    let dims = x0.dims().to_vec();
    let batch = dims[0];
    let per_sample = dims[1..].iter().product::<usize>();
    let flat = x0
        .abs()?
        .reshape((batch, per_sample))?
        .to_dtype(DType::F32)?
        .to_vec2::<f32>()?;

    let mut thresholds = Vec::with_capacity(batch);
    for mut row in flat {
        row.sort_unstable_by(|a, b| a.total_cmp(b));
        thresholds.push(quantile_sorted(&row, percentile).max(1.0) as f32);
    }

    let mut s_shape = vec![1usize; dims.len()];
    s_shape[0] = batch;
    let s = Tensor::from_vec(thresholds, s_shape, x0.device())?.to_dtype(x0.dtype())?;
    let clipped = x0
        .broadcast_minimum(&s)?
        .broadcast_maximum(&s.neg()?)?
        .broadcast_div(&s)?;
    Ok(clipped)
}

/// Aborts the enclosing stage as soon as a sample goes non-finite instead of
/// letting NaNs propagate into later stages.
pub fn ensure_finite(sample: &Tensor, stage: &str, step: usize) -> Result<()> {
    let total = sample
        .to_dtype(DType::F32)?
        .abs()?
        .sum_all()?
        .to_scalar::<f32>()?;
    if total.is_finite() {
        Ok(())
    } else {
        Err(Error::NumericInstability {
            stage: stage.to_string(),
            step,
        })
    }
}

// Row-major (out_len, in_len) interpolation weights for a bilinear resize
// with align_corners=false semantics.
fn bilinear_weights(out_len: usize, in_len: usize) -> Vec<f32> {
    let scale = in_len as f64 / out_len as f64;
    let mut weights = vec![0f32; out_len * in_len];
    for i in 0..out_len {
        let src = ((i as f64 + 0.5) * scale - 0.5).clamp(0., (in_len - 1) as f64);
        let lo = src.floor() as usize;
        let hi = (lo + 1).min(in_len - 1);
        let frac = (src - lo as f64) as f32;
        weights[i * in_len + lo] += 1. - frac;
        weights[i * in_len + hi] += frac;
    }
    weights
}

/// Deterministic separable bilinear upsampling of a `(b, c, h, w)` tensor by
/// an integer factor. Expressed as two interpolation-matrix products so the
/// whole batch resizes in one pass.
pub fn upsample_bilinear(x: &Tensor, scale: usize) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let (out_h, out_w) = (h * scale, w * scale);
    let device = x.device();

    let w_h = Tensor::from_vec(bilinear_weights(out_h, h), (out_h, h), device)?
        .to_dtype(x.dtype())?
        .unsqueeze(0)?;
    let w_w = Tensor::from_vec(bilinear_weights(out_w, w), (out_w, w), device)?
        .to_dtype(x.dtype())?
        .transpose(0, 1)?
        .unsqueeze(0)?;

    let rows = w_h.broadcast_matmul(&x.reshape((b * c, h, w))?)?;
    let resized = rows.broadcast_matmul(&w_w)?;
    Ok(resized.reshape((b, c, out_h, out_w))?)
}
