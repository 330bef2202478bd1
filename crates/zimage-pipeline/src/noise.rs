//! Начальный латентный шум.
//!
//! Шум генерируется на хосте (`StdRng` + Box-Muller) и копируется на
//! устройство: один и тот же seed даёт один и тот же латент на CPU, Metal и CUDA.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use zimage_core::ZImageResult;

/// `N(0, 1)` latent of shape `[1, channels, latent_h, latent_w]` in f32.
pub fn initial_noise(
    channels: usize,
    latent_h: usize,
    latent_w: usize,
    seed: Option<u64>,
    device: &Device,
) -> ZImageResult<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let count = channels * latent_h * latent_w;
    let values = standard_normal(&mut rng, count);
    Ok(Tensor::from_vec(values, (1, channels, latent_h, latent_w), device)?)
}

fn standard_normal<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(count + 1);
    while out.len() < count {
        // 1 - u лежит в (0, 1]: ln не уходит в -inf.
        let u1: f64 = 1.0 - rng.r#gen::<f64>();
        let u2: f64 = rng.r#gen::<f64>();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        out.push((r * theta.cos()) as f32);
        out.push((r * theta.sin()) as f32);
    }
    out.truncate(count);
    out
}
