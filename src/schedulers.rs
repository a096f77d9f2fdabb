//! Beta-schedule construction and the enums shared by both samplers.
//!
//! A beta schedule is the per-step variance sequence the denoising networks
//! were trained against; everything downstream (cumulative alphas, sigmas,
//! log-SNR) derives from it.

use serde::{Deserialize, Serialize};

use crate::{utils, Error, Result};

/// How beta ranges from its minimum to its maximum value over training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    /// Linear interpolation.
    Linear,
    /// Linear interpolation of the square root of beta.
    SqrtLinear,
    /// Squared-cosine schedule, Nichol & Dhariwal 2021.
    Cosine,
}

impl BetaSchedule {
    /// Parses a schedule name. Colon-qualified names (`"vp:linear"`) resolve
    /// to their last segment.
    pub fn from_name(name: &str) -> Result<Self> {
        let name = name.rsplit(':').next().unwrap_or(name);
        match name {
            "linear" => Ok(Self::Linear),
            "sqrt_linear" => Ok(Self::SqrtLinear),
            "cosine" => Ok(Self::Cosine),
            _ => Err(Error::config(format!("unknown beta schedule {name:?}"))),
        }
    }
}

impl std::str::FromStr for BetaSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// What the denoising model predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// The noise of the diffusion process.
    Epsilon,
    /// The clean sample directly.
    Sample,
}

/// Reverse-process variance mode. Only the `eta > 0` noise-injection
/// magnitude of the ancestral sampler depends on this; the deterministic
/// path is identical for all modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceType {
    #[default]
    FixedSmall,
    FixedLarge,
    /// No variance channel is available through the abstract denoiser
    /// contract, so learned variance samples with the fixed-small magnitude.
    Learned,
}

fn betas_for_alpha_bar(num_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| {
        f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2)
    };
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

/// Builds the length-`num_timesteps` variance sequence for a schedule.
///
/// `init_beta`/`last_beta` default to the usual 0.0001/0.02 scaled by
/// `1000 / num_timesteps`. Out-of-range values are a construction error, not
/// a runtime assertion later in sampling.
pub fn beta_schedule(
    schedule: BetaSchedule,
    num_timesteps: usize,
    init_beta: Option<f64>,
    last_beta: Option<f64>,
) -> Result<Vec<f64>> {
    if num_timesteps == 0 {
        return Err(Error::config("num_timesteps must be positive"));
    }
    let scale = 1000. / num_timesteps as f64;
    let init_beta = init_beta.unwrap_or(scale * 0.0001);
    let last_beta = last_beta.unwrap_or(scale * 0.02);

    let betas = match schedule {
        BetaSchedule::Linear => utils::linspace(init_beta, last_beta, num_timesteps),
        BetaSchedule::SqrtLinear => {
            utils::linspace(init_beta.sqrt(), last_beta.sqrt(), num_timesteps)
                .into_iter()
                .map(|b| b * b)
                .collect()
        }
        BetaSchedule::Cosine => betas_for_alpha_bar(num_timesteps, 0.999),
    };

    if let Some(beta) = betas.iter().find(|b| !(0. < **b && **b < 1.)) {
        return Err(Error::config(format!(
            "beta value {beta} outside (0, 1) for {schedule:?} schedule with \
             init_beta={init_beta}, last_beta={last_beta}"
        )));
    }
    Ok(betas)
}

/// Cumulative product of `1 - beta`; strictly decreasing and in (0, 1].
pub fn alphas_cumprod(betas: &[f64]) -> Vec<f64> {
    let mut acc = Vec::with_capacity(betas.len());
    for &beta in betas {
        let alpha = 1.0 - beta;
        acc.push(alpha * *acc.last().unwrap_or(&1f64));
    }
    acc
}
