use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use super::{NoiseSchedule, NoiseSource, Sampler};

const DISTILLATION_STEPS: usize = 50;
const SIGMA_DATA: f64 = 0.5;
const TIMESTEP_SCALING: f64 = 10.0;

/// Latent consistency sampler. Each step predicts the clean latent through
/// the consistency boundary condition, then re-noises it to the next
/// timestep with fresh noise.
pub struct LcmSampler {
    timesteps: Vec<usize>,
    schedule: NoiseSchedule,
}

impl LcmSampler {
    pub fn new(steps: usize, schedule: &NoiseSchedule) -> Result<Self> {
        if steps == 0 || steps > DISTILLATION_STEPS {
            bail!("lcm needs between 1 and {DISTILLATION_STEPS} steps, got {steps}");
        }
        let k = schedule.train_timesteps() / DISTILLATION_STEPS;
        // Distillation timesteps k-1, 2k-1, ..., 1000-1, walked backwards.
        let origin: Vec<usize> = (1..=DISTILLATION_STEPS)
            .rev()
            .map(|i| i * k - 1)
            .collect();
        let timesteps = (0..steps)
            .map(|i| origin[i * DISTILLATION_STEPS / steps])
            .collect();
        Ok(Self {
            timesteps,
            schedule: schedule.clone(),
        })
    }

    /// (c_skip, c_out) of the boundary condition at `timestep`.
    fn boundary_scalings(timestep: usize) -> (f64, f64) {
        let scaled = timestep as f64 * TIMESTEP_SCALING;
        let denom = scaled * scaled + SIGMA_DATA * SIGMA_DATA;
        (SIGMA_DATA * SIGMA_DATA / denom, scaled / denom.sqrt())
    }
}

impl Sampler for LcmSampler {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        1.0
    }

    fn scale_model_input(&self, sample: Tensor, _step_index: usize) -> Result<Tensor> {
        Ok(sample)
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        step_index: usize,
        sample: &Tensor,
        noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let out_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let eps = model_output.to_dtype(DType::F32)?;

        let timestep = self.timesteps[step_index];
        let alpha_prod_t = self.schedule.alpha_cumprod(timestep);
        let beta_prod_t = 1.0 - alpha_prod_t;

        let (c_skip, c_out) = Self::boundary_scalings(timestep);
        let predicted = ((&sample - (&eps * beta_prod_t.sqrt())?)? / alpha_prod_t.sqrt())?;
        let denoised = ((predicted * c_out)? + (&sample * c_skip)?)?;

        let prev = match self.timesteps.get(step_index + 1) {
            None => denoised,
            Some(&next) => {
                let alpha_prod_prev = self.schedule.alpha_cumprod(next);
                let fresh = noise.randn(denoised.shape(), denoised.device(), DType::F32)?;
                ((denoised * alpha_prod_prev.sqrt())?
                    + (fresh * (1.0 - alpha_prod_prev).sqrt())?)?
            }
        };
        Ok(prev.to_dtype(out_dtype)?)
    }
}
