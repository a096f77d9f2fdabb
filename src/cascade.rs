//! Three-stage cascade orchestration: a base generator followed by two
//! upsampling stages, each an independently-scheduled diffusion process
//! conditioned on the previous stage's upsampled output.

use std::sync::Arc;

use candle::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ddim::{DdimParams, DdimSampler};
use crate::dpm_solver::{DpmSolver, DpmSolverParams, NoiseSchedule, SolverMethod, SolverType};
use crate::guidance::{Conditioning, ConditioningPair, Denoiser, GuidanceConfig};
use crate::schedulers::{beta_schedule, BetaSchedule, PredictionType, VarianceType};
use crate::{utils, Error, Result};

/// External text-encoding capability; the cascade only sees its output.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<TextEmbedding>;
}

#[derive(Debug, Clone)]
pub struct TextEmbedding {
    /// Per-token context.
    pub context: Tensor,
    /// Pooled sentence embedding.
    pub pooled: Tensor,
    /// Attention mask over the tokens.
    pub mask: Tensor,
}

/// Per-stage diffusion configuration, loadable from a JSON stage-config
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Beta schedule name; colon-qualified variants resolve to their last
    /// segment.
    pub schedule: String,
    pub num_timesteps: usize,
    #[serde(default)]
    pub init_beta: Option<f64>,
    #[serde(default)]
    pub last_beta: Option<f64>,
    #[serde(default)]
    pub var_type: VarianceType,
    /// Use the fast multistep solver instead of the ancestral sampler.
    #[serde(default)]
    pub use_dpm: bool,
    /// Guidance scale baked into the solver (the ancestral sampler takes its
    /// scale per request instead).
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    /// Integrate the solver in clean-sample space.
    #[serde(default)]
    pub predict_x0: Option<bool>,
}

/// The three optional per-stage sections of a diffusion-config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffusionParams {
    #[serde(default)]
    pub generator_config: Option<StageConfig>,
    #[serde(default)]
    pub upsampler_256_config: Option<StageConfig>,
    #[serde(default)]
    pub upsampler_1024_config: Option<StageConfig>,
}

impl DiffusionParams {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("malformed diffusion params: {e}")))
    }
}

/// The sampler a stage dispatches to, fixed at configuration time.
#[derive(Debug, Clone)]
pub enum StageSampler {
    Ancestral(DdimSampler),
    FastSolver(DpmSolver),
}

impl StageSampler {
    pub fn from_config(config: &StageConfig) -> Result<Self> {
        let schedule = BetaSchedule::from_name(&config.schedule)?;
        if config.use_dpm {
            let noise_schedule = match schedule {
                BetaSchedule::Cosine => NoiseSchedule::cosine(),
                _ => {
                    let betas = beta_schedule(
                        schedule,
                        config.num_timesteps,
                        config.init_beta,
                        config.last_beta,
                    )?;
                    NoiseSchedule::discrete(&betas)?
                }
            };
            let guidance = GuidanceConfig {
                scale: config.guidance_scale.unwrap_or(1.0),
                output_kind: PredictionType::Epsilon,
            };
            Ok(Self::FastSolver(DpmSolver::new(
                noise_schedule,
                config.predict_x0.unwrap_or(false),
                guidance,
                // Per-step thresholding in the ancestral sampler is the
                // cascade-wide clipping mechanism; no end thresholding here.
                None,
            )))
        } else {
            Ok(Self::Ancestral(DdimSampler::new(
                schedule,
                config.num_timesteps,
                config.init_beta,
                config.last_beta,
                PredictionType::Epsilon,
                config.var_type,
            )?))
        }
    }
}

/// Request-level knobs resolved for one stage.
#[derive(Debug, Clone, Copy)]
struct StageKnobs {
    timesteps: usize,
    percentile: f64,
    guide_scale: f64,
    ddim_timesteps: usize,
    ddim_eta: f64,
}

#[derive(Debug, Clone, Copy)]
struct SolverKnobs {
    order: usize,
    solver_type: SolverType,
    method: SolverMethod,
}

/// One diffusion stage: resolution, sampler and the denoising network it
/// drives. Stages never reference each other; the cascade owns the chaining.
#[derive(Clone)]
pub struct CascadeStage {
    name: String,
    resolution: usize,
    sampler: StageSampler,
    denoiser: Arc<dyn Denoiser>,
}

impl CascadeStage {
    pub fn new(
        name: impl Into<String>,
        resolution: usize,
        config: &StageConfig,
        denoiser: Arc<dyn Denoiser>,
    ) -> Result<Self> {
        if resolution == 0 {
            return Err(Error::config("stage resolution must be positive"));
        }
        Ok(Self {
            name: name.into(),
            resolution,
            sampler: StageSampler::from_config(config)?,
            denoiser,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn sampler(&self) -> &StageSampler {
        &self.sampler
    }

    /// A copy of this stage with a rebuilt sampler; the denoiser reference
    /// is shared, not reloaded.
    fn with_config(&self, config: &StageConfig) -> Result<Self> {
        Ok(Self {
            name: self.name.clone(),
            resolution: self.resolution,
            sampler: StageSampler::from_config(config)?,
            denoiser: Arc::clone(&self.denoiser),
        })
    }

    fn run<R: Rng + ?Sized>(
        &self,
        noise: Tensor,
        conditioning: &ConditioningPair,
        knobs: &StageKnobs,
        solver: &SolverKnobs,
        rng: &mut R,
    ) -> Result<Tensor> {
        match &self.sampler {
            StageSampler::Ancestral(sampler) => sampler.sample(
                &self.name,
                self.denoiser.as_ref(),
                noise,
                conditioning,
                &DdimParams {
                    ddim_timesteps: knobs.ddim_timesteps,
                    eta: knobs.ddim_eta,
                    percentile: Some(knobs.percentile),
                    guide_scale: knobs.guide_scale,
                },
                rng,
            ),
            StageSampler::FastSolver(sampler) => sampler.sample(
                &self.name,
                self.denoiser.as_ref(),
                noise,
                conditioning,
                &DpmSolverParams {
                    steps: knobs.timesteps,
                    order: solver.order,
                    solver_type: solver.solver_type,
                    method: solver.method,
                },
            ),
        }
    }
}

/// A `generate` request. Per-stage keys carry the stage name as prefix;
/// everything except `text` has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    pub text: String,
    /// Skip inter-stage upsampling to inspect raw stage output.
    pub debug: bool,
    /// Fast-solver order, 1 to 3.
    pub order: usize,
    pub solver_type: String,
    pub method: String,

    pub generator_timesteps: usize,
    pub generator_percentile: f64,
    pub generator_guide_scale: f64,
    pub generator_ddim_timesteps: usize,
    pub generator_ddim_eta: f64,

    pub upsampler_256_timesteps: usize,
    pub upsampler_256_percentile: f64,
    pub upsampler_256_guide_scale: f64,
    pub upsampler_256_ddim_timesteps: usize,
    pub upsampler_256_ddim_eta: f64,

    pub upsampler_1024_timesteps: usize,
    pub upsampler_1024_percentile: f64,
    pub upsampler_1024_guide_scale: f64,
    pub upsampler_1024_ddim_timesteps: usize,
    pub upsampler_1024_ddim_eta: f64,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            text: String::new(),
            debug: false,
            order: 2,
            solver_type: "dpm_solver".to_string(),
            method: "multistep".to_string(),
            generator_timesteps: 20,
            generator_percentile: 0.995,
            generator_guide_scale: 5.0,
            generator_ddim_timesteps: 250,
            generator_ddim_eta: 0.0,
            upsampler_256_timesteps: 20,
            upsampler_256_percentile: 0.995,
            upsampler_256_guide_scale: 5.0,
            upsampler_256_ddim_timesteps: 50,
            upsampler_256_ddim_eta: 0.0,
            upsampler_1024_timesteps: 20,
            upsampler_1024_percentile: 0.995,
            upsampler_1024_guide_scale: 5.0,
            upsampler_1024_ddim_timesteps: 20,
            upsampler_1024_ddim_eta: 0.0,
        }
    }
}

impl GenerateRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::validation(format!("malformed request: {e}")))
    }
}

/// The cascade: generator plus two upsamplers, all read-only between calls
/// so independent `generate` invocations may run concurrently as long as the
/// denoisers themselves allow it.
#[derive(Clone)]
pub struct Cascade {
    text_encoder: Arc<dyn TextEncoder>,
    generator: CascadeStage,
    upsampler_256: CascadeStage,
    upsampler_1024: CascadeStage,
    device: Device,
}

impl Cascade {
    pub fn new(
        text_encoder: Arc<dyn TextEncoder>,
        generator: CascadeStage,
        upsampler_256: CascadeStage,
        upsampler_1024: CascadeStage,
        device: Device,
    ) -> Result<Self> {
        if upsampler_256.resolution != 4 * generator.resolution
            || upsampler_1024.resolution != 4 * upsampler_256.resolution
        {
            return Err(Error::config(format!(
                "stage resolutions must quadruple: {} -> {} -> {}",
                generator.resolution, upsampler_256.resolution, upsampler_1024.resolution
            )));
        }
        Ok(Self {
            text_encoder,
            generator,
            upsampler_256,
            upsampler_1024,
            device,
        })
    }

    pub fn generator(&self) -> &CascadeStage {
        &self.generator
    }

    pub fn upsampler_256(&self) -> &CascadeStage {
        &self.upsampler_256
    }

    pub fn upsampler_1024(&self) -> &CascadeStage {
        &self.upsampler_1024
    }

    /// Builds a new cascade with the named stages' samplers rebuilt from
    /// fresh configuration. Denoiser weights are shared with `self`, which
    /// stays fully usable: in-flight calls keep the stages they started
    /// with.
    pub fn with_diffusion_params(&self, params: &DiffusionParams) -> Result<Self> {
        let rebuild = |stage: &CascadeStage, config: &Option<StageConfig>| match config {
            Some(config) => stage.with_config(config),
            None => Ok(stage.clone()),
        };
        Ok(Self {
            text_encoder: Arc::clone(&self.text_encoder),
            generator: rebuild(&self.generator, &params.generator_config)?,
            upsampler_256: rebuild(&self.upsampler_256, &params.upsampler_256_config)?,
            upsampler_1024: rebuild(&self.upsampler_1024, &params.upsampler_1024_config)?,
            device: self.device.clone(),
        })
    }

    /// Runs the full cascade for one prompt and returns an `(h, w, 3)` u8
    /// pixel tensor.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        request: &GenerateRequest,
        rng: &mut R,
    ) -> Result<Tensor> {
        if request.text.trim().is_empty() {
            return Err(Error::validation("the `text` field is required"));
        }
        if !(1..=3).contains(&request.order) {
            return Err(Error::config(format!(
                "solver order must be 1, 2 or 3, got {}",
                request.order
            )));
        }
        let solver = SolverKnobs {
            order: request.order,
            solver_type: request.solver_type.parse()?,
            method: request.method.parse()?,
        };

        let embedding = self.text_encoder.encode(&request.text)?;
        tracing::info!(text = %request.text, "generating image");

        // Stage 1: text-conditional generation at the base resolution.
        let resolution = self.generator.resolution;
        let noise = utils::randn((1usize, 3, resolution, resolution), &self.device, rng)?;
        let pair = ConditioningPair {
            cond: Conditioning {
                context: Some(embedding.context.clone()),
                pooled: Some(embedding.pooled.clone()),
                mask: Some(embedding.mask.clone()),
                ..Default::default()
            },
            uncond: Some(Conditioning {
                context: Some(embedding.context.zeros_like()?),
                pooled: Some(embedding.pooled.zeros_like()?),
                mask: Some(embedding.mask.clone()),
                ..Default::default()
            }),
        };
        let knobs = StageKnobs {
            timesteps: request.generator_timesteps,
            percentile: request.generator_percentile,
            guide_scale: request.generator_guide_scale,
            ddim_timesteps: request.generator_ddim_timesteps,
            ddim_eta: request.generator_ddim_eta,
        };
        let mut image = self.generator.run(noise, &pair, &knobs, &solver, rng)?;
        tracing::debug!(stage = %self.generator.name, "stage complete");

        // Stage 2: upsample, then denoise conditioned on the low-res image
        // and the text. The unconditional branch keeps the image but zeroes
        // the whole text bundle.
        if !request.debug {
            image = utils::upsample_bilinear(&image, 4)?;
        }
        let noise = utils::randn_like(&image, rng)?;
        let low_res_timestep = Tensor::zeros((1,), DType::F32, &self.device)?;
        let pair = ConditioningPair {
            cond: Conditioning {
                context: Some(embedding.context.clone()),
                pooled: Some(embedding.pooled.clone()),
                mask: Some(embedding.mask.clone()),
                low_res: Some(image.clone()),
                low_res_timestep: Some(low_res_timestep.clone()),
                ..Default::default()
            },
            uncond: Some(Conditioning {
                context: Some(embedding.context.zeros_like()?),
                pooled: Some(embedding.pooled.zeros_like()?),
                mask: Some(embedding.mask.zeros_like()?),
                low_res: Some(image.clone()),
                low_res_timestep: Some(low_res_timestep),
                ..Default::default()
            }),
        };
        let knobs = StageKnobs {
            timesteps: request.upsampler_256_timesteps,
            percentile: request.upsampler_256_percentile,
            guide_scale: request.upsampler_256_guide_scale,
            ddim_timesteps: request.upsampler_256_ddim_timesteps,
            ddim_eta: request.upsampler_256_ddim_eta,
        };
        image = self.upsampler_256.run(noise, &pair, &knobs, &solver, rng)?;
        tracing::debug!(stage = %self.upsampler_256.name, "stage complete");

        // Stage 3: unguided, conditioned solely on the concatenated image.
        if !request.debug {
            image = utils::upsample_bilinear(&image, 4)?;
        }
        let noise = utils::randn_like(&image, rng)?;
        let pair = ConditioningPair::unguided(Conditioning {
            concat: Some(image.clone()),
            ..Default::default()
        });
        let knobs = StageKnobs {
            timesteps: request.upsampler_1024_timesteps,
            percentile: request.upsampler_1024_percentile,
            guide_scale: request.upsampler_1024_guide_scale,
            ddim_timesteps: request.upsampler_1024_ddim_timesteps,
            ddim_eta: request.upsampler_1024_ddim_eta,
        };
        image = self.upsampler_1024.run(noise, &pair, &knobs, &solver, rng)?;
        tracing::debug!(stage = %self.upsampler_1024.name, "stage complete");

        to_pixels(&image)
    }
}

/// Clamp to the canonical signed range and reorder into an `(h, w, c)` 8-bit
/// pixel tensor.
fn to_pixels(image: &Tensor) -> Result<Tensor> {
    let image = ((image.clamp(-1., 1.)? + 1.)? * 127.5)?;
    Ok(image.round()?.to_dtype(DType::U8)?.squeeze(0)?.permute((1, 2, 0))?)
}
