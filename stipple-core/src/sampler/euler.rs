use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use super::{leading_timesteps, NoiseSchedule, NoiseSource, Sampler};

/// Ancestral Euler sampler: an Euler step down to `sigma_down` followed by
/// fresh noise of size `sigma_up`.
pub struct EulerAncestral {
    timesteps: Vec<usize>,
    sigmas: Vec<f64>,
    init_noise_sigma: f64,
}

impl EulerAncestral {
    pub fn new(steps: usize, schedule: &NoiseSchedule) -> Result<Self> {
        let train = schedule.train_timesteps();
        if steps == 0 || steps > train {
            bail!("euler_a needs between 1 and {train} steps, got {steps}");
        }
        let timesteps = leading_timesteps(steps, steps, train);
        if timesteps[0] >= train {
            bail!("euler_a cannot space {steps} steps over {train} training timesteps");
        }
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| schedule.sigma(t)).collect();
        sigmas.push(0.0);
        let init_noise_sigma = (sigmas[0] * sigmas[0] + 1.0).sqrt();
        Ok(Self {
            timesteps,
            sigmas,
            init_noise_sigma,
        })
    }
}

impl Sampler for EulerAncestral {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn init_noise_sigma(&self) -> f64 {
        self.init_noise_sigma
    }

    fn scale_model_input(&self, sample: Tensor, step_index: usize) -> Result<Tensor> {
        let sigma = self.sigmas[step_index];
        Ok((sample / (sigma * sigma + 1.0).sqrt())?)
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

        let sigma_from = self.sigmas[step_index];
        let sigma_to = self.sigmas[step_index + 1];
        let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
            / sigma_from.powi(2))
        .sqrt();
        // sqrt(sigma_to^2 - sigma_up^2), simplified so rounding cannot go negative.
        let sigma_down = sigma_to.powi(2) / sigma_from;

        // The derivative (sample - x0) / sigma is exactly eps for epsilon prediction.
        let prev = (&sample + (&eps * (sigma_down - sigma_from))?)?;
        let prev = if sigma_up > 0.0 {
            let fresh = noise.randn(prev.shape(), prev.device(), DType::F32)?;
            (prev + (fresh * sigma_up)?)?
        } else {
            prev
        };
        Ok(prev.to_dtype(out_dtype)?)
    }
}
