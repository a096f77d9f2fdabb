//! Conditioning bundles and classifier-free guidance.

use candle::Tensor;

use crate::schedulers::PredictionType;
use crate::{Error, Result};

/// The capability the samplers need from a denoising network: a pure
/// function from a noisy sample, a timestep and conditioning to a prediction
/// of matching shape. The samplers never own weights or assume anything
/// about the architecture behind this.
pub trait Denoiser: Send + Sync {
    fn denoise(&self, sample: &Tensor, timestep: f64, conditioning: &Conditioning)
        -> Result<Tensor>;
}

/// Typed conditioning for one denoiser branch. Each stage fills the fields
/// its network consumes and leaves the rest unset.
#[derive(Debug, Clone, Default)]
pub struct Conditioning {
    /// Per-token text context.
    pub context: Option<Tensor>,
    /// Pooled text embedding.
    pub pooled: Option<Tensor>,
    /// Text attention mask.
    pub mask: Option<Tensor>,
    /// Upsampled output of the previous stage.
    pub low_res: Option<Tensor>,
    /// Timestep marker for the low-res conditioning image.
    pub low_res_timestep: Option<Tensor>,
    /// Image concatenated to the sampler input channel-wise.
    pub concat: Option<Tensor>,
}

/// Conditional and (optionally) unconditional branches evaluated for
/// classifier-free guidance. `uncond: None` means unguided sampling.
#[derive(Debug, Clone)]
pub struct ConditioningPair {
    pub cond: Conditioning,
    pub uncond: Option<Conditioning>,
}

impl ConditioningPair {
    pub fn unguided(cond: Conditioning) -> Self {
        Self { cond, uncond: None }
    }
}

/// Stage-level guidance configuration.
#[derive(Debug, Clone, Copy)]
pub struct GuidanceConfig {
    pub scale: f64,
    /// What the guided prediction represents.
    pub output_kind: PredictionType,
}

/// Blends a conditional and an unconditional prediction:
/// `uncond + scale * (cond - uncond)`.
///
/// `scale == 1` returns the conditional prediction exactly and `scale == 0`
/// the unconditional one, with no floating-point arithmetic in between.
pub fn classifier_free_guidance(cond: &Tensor, uncond: &Tensor, scale: f64) -> Result<Tensor> {
    if scale == 1. {
        return Ok(cond.clone());
    }
    if scale == 0. {
        return Ok(uncond.clone());
    }
    Ok((uncond + ((cond - uncond)? * scale)?)?)
}

/// Evaluates the denoiser on both branches of `pair` and blends the results.
/// With no unconditional branch this is a plain conditional evaluation and
/// `scale` is ignored.
///
/// The denoiser output must match the sample shape; a mismatch is a
/// validation error surfaced before any schedule algebra runs on it.
pub fn guided_denoise(
    model: &dyn Denoiser,
    sample: &Tensor,
    timestep: f64,
    pair: &ConditioningPair,
    scale: f64,
) -> Result<Tensor> {
    let check_shape = |out: &Tensor| -> Result<()> {
        if out.shape() != sample.shape() {
            return Err(Error::validation(format!(
                "denoiser output shape {:?} does not match sample shape {:?}",
                out.shape(),
                sample.shape()
            )));
        }
        Ok(())
    };

    let cond_out = model.denoise(sample, timestep, &pair.cond)?;
    check_shape(&cond_out)?;
    match &pair.uncond {
        None => Ok(cond_out),
        Some(_) if scale == 1. => Ok(cond_out),
        Some(uncond) => {
            let uncond_out = model.denoise(sample, timestep, uncond)?;
            check_shape(&uncond_out)?;
            classifier_free_guidance(&cond_out, &uncond_out, scale)
        }
    }
}
