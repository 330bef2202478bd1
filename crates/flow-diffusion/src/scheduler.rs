//! Flow Match Euler scheduler.
//!
//! Rectified-flow formulation: `x_t = (1 - sigma) * x_0 + sigma * noise`,
//! sigmas run from 1.0 (pure noise) down to a terminal 0.0. The schedule is
//! computed once in [`FlowMatchEulerScheduler::new`] and stays read-only; each
//! [`FlowMatchEulerScheduler::step`] is a pure function of its arguments.

use candle_core::{DType, Tensor};
use zimage_core::{ZImageError, ZImageResult};

use crate::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    num_train_timesteps: usize,
    /// `steps + 1` значений, последнее равно 0.0.
    sigmas: Vec<f64>,
    /// `steps` значений, `sigmas[i] * num_train_timesteps`.
    timesteps: Vec<f64>,
    mu: Option<f64>,
}

impl FlowMatchEulerScheduler {
    /// Build the schedule for `num_inference_steps` steps.
    ///
    /// `mu` is required when `config.use_dynamic_shifting` is set and ignored
    /// otherwise.
    pub fn new(
        num_inference_steps: usize,
        config: &SchedulerConfig,
        mu: Option<f64>,
    ) -> ZImageResult<Self> {
        config.validate()?;
        if num_inference_steps == 0 {
            return Err(ZImageError::Config("steps должен быть > 0".into()));
        }
        let mu = if config.use_dynamic_shifting {
            Some(mu.ok_or_else(|| {
                ZImageError::Config("динамический сдвиг включён, но mu не задан".into())
            })?)
        } else {
            None
        };

        let n = config.num_train_timesteps as f64;

        // Обучающие сигмы i/N для i = N..1; статический сдвиг применяется
        // только без динамического.
        let train_sigma = |s: f64| {
            if config.use_dynamic_shifting {
                s
            } else {
                static_shift(config.shift, s)
            }
        };
        let sigma_max = train_sigma(1.0);
        let sigma_min = train_sigma(1.0 / n);

        let mut sigmas: Vec<f64> = linspace(sigma_max * n, sigma_min * n, num_inference_steps)
            .into_iter()
            .map(|t| t / n)
            .collect();

        sigmas = match mu {
            Some(mu) => sigmas.into_iter().map(|s| time_shift(mu, s)).collect(),
            None => sigmas
                .into_iter()
                .map(|s| static_shift(config.shift, s))
                .collect(),
        };
        sigmas.push(0.0);

        let timesteps = sigmas[..num_inference_steps]
            .iter()
            .map(|s| s * n)
            .collect();

        Ok(Self {
            num_train_timesteps: config.num_train_timesteps,
            sigmas,
            timesteps,
            mu,
        })
    }

    pub fn sigmas(&self) -> &[f64] {
        &self.sigmas
    }

    pub fn timesteps(&self) -> &[f64] {
        &self.timesteps
    }

    pub fn num_inference_steps(&self) -> usize {
        self.timesteps.len()
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn mu(&self) -> Option<f64> {
        self.mu
    }

    /// Euler step: `sample + (sigma[index + 1] - sigma[index]) * model_output`.
    ///
    /// Arithmetic runs in f32; the result has the dtype of `sample`.
    pub fn step(&self, model_output: &Tensor, index: usize, sample: &Tensor) -> ZImageResult<Tensor> {
        if index >= self.num_inference_steps() {
            return Err(ZImageError::Inference(format!(
                "индекс шага {index} вне расписания из {} шагов",
                self.num_inference_steps()
            )));
        }
        let dt = self.sigmas[index + 1] - self.sigmas[index];

        let dtype = sample.dtype();
        let sample32 = sample.to_dtype(DType::F32)?;
        let output32 = model_output.to_dtype(DType::F32)?;
        let prev = (sample32 + (output32 * dt)?)?;
        Ok(prev.to_dtype(dtype)?)
    }
}

/// Resolution shift `mu = image_seq_len * m + b`, linear between
/// `(base_seq_len, base_shift)` and `(max_seq_len, max_shift)`.
pub fn calculate_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    max_seq_len: usize,
    base_shift: f64,
    max_shift: f64,
) -> f64 {
    let m = (max_shift - base_shift) / (max_seq_len as f64 - base_seq_len as f64);
    let b = base_shift - m * base_seq_len as f64;
    image_seq_len as f64 * m + b
}

/// Dynamic time shift `e^mu / (e^mu + (1/t - 1))`.
pub fn time_shift(mu: f64, t: f64) -> f64 {
    if t <= 0.0 || t >= 1.0 {
        return t;
    }
    let exp_mu = mu.exp();
    exp_mu / (exp_mu + (1.0 / t - 1.0))
}

fn static_shift(shift: f64, s: f64) -> f64 {
    shift * s / (1.0 + (shift - 1.0) * s)
}

/// `numpy.linspace(start, end, num)` (endpoint включён).
fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    }
}
