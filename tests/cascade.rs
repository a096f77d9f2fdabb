//! End-to-end cascade tests against small analytic denoisers.

use std::sync::Arc;

use candle::{DType, Device, Tensor};
use cascade_diffusion::{
    Cascade, CascadeStage, Conditioning, Denoiser, DiffusionParams, Error, GenerateRequest,
    Result, StageConfig, StageSampler, TextEmbedding, TextEncoder, VarianceType,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

struct FixedEncoder;

impl TextEncoder for FixedEncoder {
    fn encode(&self, _text: &str) -> Result<TextEmbedding> {
        let device = Device::Cpu;
        Ok(TextEmbedding {
            context: Tensor::ones((1, 8, 16), DType::F32, &device)?,
            pooled: Tensor::ones((1, 16), DType::F32, &device)?,
            mask: Tensor::ones((1, 8), DType::F32, &device)?,
        })
    }
}

/// Predicts a fixed fraction of the sample as noise and checks it received
/// exactly the conditioning fields its stage is supposed to assemble.
struct StageModel {
    expect_text: bool,
    expect_low_res: bool,
    expect_concat: bool,
}

impl Denoiser for StageModel {
    fn denoise(&self, sample: &Tensor, _t: f64, c: &Conditioning) -> Result<Tensor> {
        if c.context.is_some() != self.expect_text
            || c.pooled.is_some() != self.expect_text
            || c.low_res.is_some() != self.expect_low_res
            || c.low_res_timestep.is_some() != self.expect_low_res
            || c.concat.is_some() != self.expect_concat
        {
            return Err(Error::Validation(
                "unexpected conditioning fields".to_string(),
            ));
        }
        Ok((sample * 0.1)?)
    }
}

fn stage_config(use_dpm: bool) -> StageConfig {
    StageConfig {
        schedule: "linear".to_string(),
        num_timesteps: 100,
        init_beta: None,
        last_beta: None,
        var_type: VarianceType::default(),
        use_dpm,
        guidance_scale: Some(5.0),
        predict_x0: None,
    }
}

fn small_cascade() -> Result<Cascade> {
    let config = stage_config(false);
    Cascade::new(
        Arc::new(FixedEncoder),
        CascadeStage::new(
            "generator",
            4,
            &config,
            Arc::new(StageModel {
                expect_text: true,
                expect_low_res: false,
                expect_concat: false,
            }),
        )?,
        CascadeStage::new(
            "upsampler_256",
            16,
            &config,
            Arc::new(StageModel {
                expect_text: true,
                expect_low_res: true,
                expect_concat: false,
            }),
        )?,
        CascadeStage::new(
            "upsampler_1024",
            64,
            &config,
            Arc::new(StageModel {
                expect_text: false,
                expect_low_res: false,
                expect_concat: true,
            }),
        )?,
        Device::Cpu,
    )
}

fn fast_request() -> GenerateRequest {
    GenerateRequest {
        generator_ddim_timesteps: 5,
        upsampler_256_ddim_timesteps: 5,
        upsampler_1024_ddim_timesteps: 5,
        ..GenerateRequest::new("a red apple on a table")
    }
}

#[test]
fn full_cascade_produces_a_final_resolution_image() -> anyhow::Result<()> {
    let cascade = small_cascade()?;
    let image = cascade.generate(&fast_request(), &mut StdRng::seed_from_u64(42))?;

    assert_eq!(image.dims(), &[64, 64, 3]);
    assert_eq!(image.dtype(), DType::U8);
    Ok(())
}

#[test]
fn generator_stage_samples_at_its_native_resolution() -> anyhow::Result<()> {
    use cascade_diffusion::utils::randn;
    use cascade_diffusion::{
        BetaSchedule, ConditioningPair, DdimParams, DdimSampler, PredictionType,
    };

    let sampler = DdimSampler::new(
        BetaSchedule::Linear,
        1000,
        None,
        None,
        PredictionType::Epsilon,
        VarianceType::FixedSmall,
    )?;
    let model = StageModel {
        expect_text: false,
        expect_low_res: false,
        expect_concat: false,
    };
    let mut rng = StdRng::seed_from_u64(3);
    let noise = randn((1, 3, 64, 64), &Device::Cpu, &mut rng)?;
    let pair = ConditioningPair::unguided(Conditioning::default());
    let params = DdimParams {
        ddim_timesteps: 5,
        ..Default::default()
    };
    let sample = sampler.sample("generator", &model, noise, &pair, &params, &mut rng)?;
    assert_eq!(sample.dims(), &[1, 3, 64, 64]);
    let values = sample.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn fixed_seed_reproduces_the_image() -> anyhow::Result<()> {
    let cascade = small_cascade()?;
    let request = fast_request();
    let a = cascade.generate(&request, &mut StdRng::seed_from_u64(7))?;
    let b = cascade.generate(&request, &mut StdRng::seed_from_u64(7))?;
    assert_eq!(
        a.flatten_all()?.to_vec1::<u8>()?,
        b.flatten_all()?.to_vec1::<u8>()?
    );
    Ok(())
}

#[test]
fn debug_skips_upsampling() -> anyhow::Result<()> {
    // Without inter-stage upsampling every stage runs at the generator
    // resolution, so the chain only works with resolution-agnostic models.
    let cascade = small_cascade()?;
    let request = GenerateRequest {
        debug: true,
        ..fast_request()
    };
    let image = cascade.generate(&request, &mut StdRng::seed_from_u64(0))?;
    assert_eq!(image.dims(), &[4, 4, 3]);
    Ok(())
}

#[test]
fn empty_text_is_rejected_before_any_sampling() -> anyhow::Result<()> {
    let cascade = small_cascade()?;
    let request = GenerateRequest::new("   ");
    match cascade.generate(&request, &mut StdRng::seed_from_u64(0)) {
        Err(Error::Validation(_)) => Ok(()),
        other => anyhow::bail!("unexpected: {other:?}"),
    }
}

#[test]
fn bad_solver_order_is_rejected() -> anyhow::Result<()> {
    let cascade = small_cascade()?;
    let request = GenerateRequest {
        order: 4,
        ..fast_request()
    };
    match cascade.generate(&request, &mut StdRng::seed_from_u64(0)) {
        Err(Error::Config(_)) => Ok(()),
        other => anyhow::bail!("unexpected: {other:?}"),
    }
}

#[test]
fn resolution_chain_must_quadruple() {
    let config = stage_config(false);
    let model = || {
        Arc::new(StageModel {
            expect_text: false,
            expect_low_res: false,
            expect_concat: false,
        })
    };
    let res = Cascade::new(
        Arc::new(FixedEncoder),
        CascadeStage::new("generator", 4, &config, model()).unwrap(),
        CascadeStage::new("upsampler_256", 8, &config, model()).unwrap(),
        CascadeStage::new("upsampler_1024", 64, &config, model()).unwrap(),
        Device::Cpu,
    );
    assert!(matches!(res, Err(Error::Config(_))));
}

struct NanModel;

impl Denoiser for NanModel {
    fn denoise(&self, sample: &Tensor, _t: f64, _c: &Conditioning) -> Result<Tensor> {
        Ok((sample * f64::NAN)?)
    }
}

#[test]
fn instability_names_the_failing_stage() -> anyhow::Result<()> {
    let config = stage_config(false);
    let ok = |expect_text, expect_low_res, expect_concat| {
        Arc::new(StageModel {
            expect_text,
            expect_low_res,
            expect_concat,
        })
    };
    let cascade = Cascade::new(
        Arc::new(FixedEncoder),
        CascadeStage::new("generator", 4, &config, ok(true, false, false))?,
        CascadeStage::new("upsampler_256", 16, &config, Arc::new(NanModel))?,
        CascadeStage::new("upsampler_1024", 64, &config, ok(false, false, true))?,
        Device::Cpu,
    )?;
    match cascade.generate(&fast_request(), &mut StdRng::seed_from_u64(0)) {
        Err(Error::NumericInstability { stage, step: 0 }) => {
            assert_eq!(stage, "upsampler_256");
            Ok(())
        }
        other => anyhow::bail!("unexpected: {other:?}"),
    }
}

#[test]
fn reconfiguration_swaps_the_sampler_and_keeps_the_original_usable() -> anyhow::Result<()> {
    let cascade = small_cascade()?;
    assert!(matches!(
        cascade.generator().sampler(),
        StageSampler::Ancestral(_)
    ));

    let params = DiffusionParams {
        generator_config: Some(stage_config(true)),
        ..Default::default()
    };
    let reconfigured = cascade.with_diffusion_params(&params)?;
    assert!(matches!(
        reconfigured.generator().sampler(),
        StageSampler::FastSolver(_)
    ));
    assert!(matches!(
        reconfigured.upsampler_256().sampler(),
        StageSampler::Ancestral(_)
    ));

    // Both cascades sample successfully after the swap.
    let request = GenerateRequest {
        generator_timesteps: 5,
        ..fast_request()
    };
    cascade.generate(&request, &mut StdRng::seed_from_u64(1))?;
    reconfigured.generate(&request, &mut StdRng::seed_from_u64(1))?;
    Ok(())
}

#[test]
fn diffusion_params_load_from_json() -> anyhow::Result<()> {
    let params = DiffusionParams::from_json(
        r#"{
            "generator_config": {
                "schedule": "cosine",
                "num_timesteps": 1000,
                "use_dpm": true,
                "guidance_scale": 5.0
            }
        }"#,
    )?;
    assert!(params.generator_config.is_some());
    assert!(params.upsampler_256_config.is_none());

    assert!(matches!(
        DiffusionParams::from_json("{not json"),
        Err(Error::Config(_))
    ));
    Ok(())
}
