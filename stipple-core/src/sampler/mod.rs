//! Sampler selection and the samplers themselves.
//!
//! Every sampler here assumes an epsilon-predicting UNet trained on the
//! scaled-linear beta schedule shared by SD v1 and SDXL, with
//! `steps_offset = 1`.

use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

mod dpm;
mod euler;
mod lcm;

pub use dpm::DpmSolverMultistep;
pub use euler::EulerAncestral;
pub use lcm::LcmSampler;

/// LCM is distilled for 2-8 steps.
pub const LCM_MAX_STEPS: usize = 8;
/// LCM expects no classifier-free guidance.
pub const LCM_GUIDANCE: f64 = 1.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerKind {
    #[default]
    #[serde(rename = "dpmpp2m")]
    DpmSolverPlusPlus2M,
    #[serde(rename = "euler_a")]
    EulerAncestral,
    #[serde(rename = "lcm")]
    Lcm,
}

serde_plain::derive_display_from_serialize!(SamplerKind);

impl FromStr for SamplerKind {
    type Err = serde_plain::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_plain::from_str(&s.trim().to_ascii_lowercase())
    }
}

impl SamplerKind {
    pub const ALL: [SamplerKind; 3] = [
        SamplerKind::DpmSolverPlusPlus2M,
        SamplerKind::EulerAncestral,
        SamplerKind::Lcm,
    ];

    pub fn build(self, steps: usize, schedule: &NoiseSchedule) -> Result<Box<dyn Sampler>> {
        Ok(match self {
            Self::DpmSolverPlusPlus2M => Box::new(DpmSolverMultistep::new(steps, schedule)?),
            Self::EulerAncestral => Box::new(EulerAncestral::new(steps, schedule)?),
            Self::Lcm => Box::new(LcmSampler::new(steps, schedule)?),
        })
    }
}

/// The effective sampler, step count and guidance for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerPlan {
    pub kind: SamplerKind,
    pub steps: usize,
    pub guidance: f64,
}

impl SamplerPlan {
    /// `use_lcm` and an explicit `lcm` scheduler are equivalent; both cap the
    /// step count and disable guidance.
    pub fn resolve(
        use_lcm: bool,
        scheduler: Option<SamplerKind>,
        steps: usize,
        guidance: f64,
    ) -> Self {
        if use_lcm || scheduler == Some(SamplerKind::Lcm) {
            Self {
                kind: SamplerKind::Lcm,
                steps: steps.min(LCM_MAX_STEPS),
                guidance: LCM_GUIDANCE,
            }
        } else {
            Self {
                kind: scheduler.unwrap_or_default(),
                steps,
                guidance,
            }
        }
    }
}

/// Classifier-free guidance only runs the unconditional branch when it changes the result.
pub fn uses_guidance(guidance: f64) -> bool {
    guidance > 1.0
}

/// Discrete training noise schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Betas linear in sqrt-space, as used by SD v1 and SDXL.
    pub fn scaled_linear(beta_start: f64, beta_end: f64, train_timesteps: usize) -> Self {
        let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
        let mut cumprod = 1.0;
        let alphas_cumprod = (0..train_timesteps)
            .map(|i| {
                let t = if train_timesteps > 1 {
                    i as f64 / (train_timesteps - 1) as f64
                } else {
                    0.0
                };
                let beta = (start + t * (end - start)).powi(2);
                cumprod *= 1.0 - beta;
                cumprod
            })
            .collect();
        Self { alphas_cumprod }
    }

    pub fn stable_diffusion() -> Self {
        Self::scaled_linear(0.00085, 0.012, 1000)
    }

    pub fn train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn alpha_cumprod(&self, timestep: usize) -> f64 {
        self.alphas_cumprod[timestep]
    }

    /// Noise level of timestep `t` in the variance-exploding parameterisation.
    pub fn sigma(&self, timestep: usize) -> f64 {
        let a = self.alpha_cumprod(timestep);
        ((1.0 - a) / a).sqrt()
    }
}

/// "Leading" spacing: multiples of `train / divisor` in descending order.
pub(crate) fn leading_timesteps(
    steps: usize,
    divisor: usize,
    train_timesteps: usize,
) -> Vec<usize> {
    let ratio = train_timesteps / divisor;
    (0..steps).rev().map(|i| i * ratio + 1).collect()
}

/// Source of every random number a generation consumes.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Standard-normal tensor, sampled on the host so results do not depend on the device.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?)
    }
}

pub trait Sampler: Send {
    fn timesteps(&self) -> &[usize];

    fn init_noise_sigma(&self) -> f64;

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor>;

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor>;
}
