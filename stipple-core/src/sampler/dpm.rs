use anyhow::{bail, Result};
use candle_core::{DType, Tensor};

use super::{NoiseSchedule, NoiseSource, Sampler};

/// DPM-Solver++ (2M): second-order multistep solver on the data prediction,
/// midpoint variant. The first step has no history and the final step lands
/// on sigma zero, so both run first-order.
pub struct DpmSolverMultistep {
    timesteps: Vec<usize>,
    /// One entry per timestep plus a trailing zero.
    sigmas: Vec<f64>,
    prev_denoised: Option<Tensor>,
}

impl DpmSolverMultistep {
    pub fn new(steps: usize, schedule: &NoiseSchedule) -> Result<Self> {
        let train = schedule.train_timesteps();
        if steps == 0 || steps >= train {
            bail!("dpmpp2m needs between 1 and {} steps, got {steps}", train - 1);
        }
        let ratio = train / (steps + 1);
        let timesteps: Vec<usize> = (1..=steps).rev().map(|i| i * ratio + 1).collect();
        if timesteps[0] >= train {
            bail!("dpmpp2m cannot space {steps} steps over {train} training timesteps");
        }
        let mut sigmas: Vec<f64> = timesteps.iter().map(|&t| schedule.sigma(t)).collect();
        sigmas.push(0.0);
        Ok(Self {
            timesteps,
            sigmas,
            prev_denoised: None,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }
}

/// (alpha_t, sigma_t) of the variance-preserving process at noise level `sigma`.
fn alpha_sigma(sigma: f64) -> (f64, f64) {
    let alpha = 1.0 / (sigma * sigma + 1.0).sqrt();
    (alpha, sigma * alpha)
}

fn lambda(sigma: f64) -> f64 {
    let (alpha, sigma) = alpha_sigma(sigma);
    alpha.ln() - sigma.ln()
}

impl Sampler for DpmSolverMultistep {
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
        _noise: &mut NoiseSource,
    ) -> Result<Tensor> {
        let out_dtype = sample.dtype();
        let sample = sample.to_dtype(DType::F32)?;
        let eps = model_output.to_dtype(DType::F32)?;

        let sigma_s0 = self.sigmas[step_index];
        let sigma_t = self.sigmas[step_index + 1];
        let (alpha_s0, sig_s0) = alpha_sigma(sigma_s0);

        let denoised = ((&sample - (&eps * sig_s0)?)? / alpha_s0)?;

        let prev_sample = if sigma_t == 0.0 {
            denoised.clone()
        } else {
            let (alpha_t, sig_t) = alpha_sigma(sigma_t);
            let h = lambda(sigma_t) - lambda(sigma_s0);
            let phi = alpha_t * ((-h).exp() - 1.0);
            let first_order = ((&sample * (sig_t / sig_s0))? - (&denoised * phi)?)?;
            match &self.prev_denoised {
                None => first_order,
                Some(prev) => {
                    let sigma_s1 = self.sigmas[step_index - 1];
                    let r0 = (lambda(sigma_s0) - lambda(sigma_s1)) / h;
                    let d1 = ((&denoised - prev)? / r0)?;
                    (first_order - (d1 * (0.5 * phi))?)?
                }
            }
        };

        self.prev_denoised = Some(denoised);
        Ok(prev_sample.to_dtype(out_dtype)?)
    }
}
