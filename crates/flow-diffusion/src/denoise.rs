//! Guided denoising loop.
//!
//! One transformer call per scheduler step. With classifier-free guidance
//! the latent is doubled along the batch axis and paired with
//! `[positive, negative]` embeddings; the halves are then combined as
//! `positive + scale * (positive - negative)`.

use candle_core::{DType, Tensor};
use tracing::{debug, info};
use zimage_core::{ZImageError, ZImageResult, sync_barrier};

use crate::scheduler::FlowMatchEulerScheduler;

/// Масштаб нормализации timestep для трансформера Z-Image.
const TIMESTEP_SCALE: f64 = 1000.0;

/// Диффузионный трансформер.
pub trait DiffusionTransformer {
    /// `latents` `[B, C, h, w]`, `timestep` `[1]` (normalized to `[0, 1]`),
    /// `prompt_embeds` `[B, seq, hidden]` → prediction `[B, C, h, w]`.
    fn forward(
        &self,
        latents: &Tensor,
        timestep: &Tensor,
        prompt_embeds: &Tensor,
    ) -> ZImageResult<Tensor>;
}

impl<T: DiffusionTransformer + ?Sized> DiffusionTransformer for &T {
    fn forward(
        &self,
        latents: &Tensor,
        timestep: &Tensor,
        prompt_embeds: &Tensor,
    ) -> ZImageResult<Tensor> {
        (**self).forward(latents, timestep, prompt_embeds)
    }
}

/// Text-encoder output for one request.
#[derive(Debug, Clone)]
pub struct PromptEmbeddings {
    /// `[1, seq, hidden]`.
    pub positive: Tensor,
    /// `[1, seq', hidden]`; present only when guidance is requested.
    pub negative: Option<Tensor>,
}

impl PromptEmbeddings {
    pub fn new(positive: Tensor, negative: Option<Tensor>) -> Self {
        Self { positive, negative }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DenoiseConfig {
    pub guidance_scale: f64,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            guidance_scale: zimage_core::ModelMetadata::RECOMMENDED_GUIDANCE_SCALE,
        }
    }
}

impl DenoiseConfig {
    /// CFG включается только при `guidance_scale > 1`.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }
}

/// `positive + scale * (positive - negative)`.
pub fn combine_cfg(positive: &Tensor, negative: &Tensor, scale: f64) -> ZImageResult<Tensor> {
    let delta = (positive - negative)?;
    Ok((positive + (delta * scale)?)?)
}

/// Run every scheduler step and return the final latent.
pub fn run_denoising<T: DiffusionTransformer + ?Sized>(
    transformer: &T,
    initial_latent: Tensor,
    embeddings: &PromptEmbeddings,
    scheduler: &FlowMatchEulerScheduler,
    config: &DenoiseConfig,
) -> ZImageResult<Tensor> {
    let debug_stats = zimage_core::debug::enabled();
    let device = initial_latent.device().clone();
    let batch = initial_latent.dims4()?.0;

    let positive = &embeddings.positive;
    let negative = match &embeddings.negative {
        Some(negative) if config.uses_guidance() => Some(negative),
        _ => None,
    };

    // Эмбеддинги разной длины не складываются в один батч: тогда два прохода.
    let batched_embeds = match negative {
        Some(negative) if negative.dim(1)? == positive.dim(1)? => {
            Some(Tensor::cat(&[positive, negative], 0)?)
        }
        _ => None,
    };

    info!(
        steps = scheduler.num_inference_steps(),
        cfg = negative.is_some(),
        guidance = config.guidance_scale,
        "денойзинг"
    );

    let mut latents = initial_latent;
    for (index, &t) in scheduler.timesteps().iter().enumerate() {
        let normalized = (TIMESTEP_SCALE - t) / TIMESTEP_SCALE;
        let timestep = Tensor::new(&[normalized as f32], &device)?;

        let guided = match negative {
            None => transformer.forward(&latents, &timestep, positive)?,
            Some(negative) => {
                let (pos_pred, neg_pred) = match &batched_embeds {
                    Some(embeds) => {
                        let doubled = Tensor::cat(&[&latents, &latents], 0)?;
                        let pred = transformer.forward(&doubled, &timestep, embeds)?;
                        (pred.narrow(0, 0, batch)?, pred.narrow(0, batch, batch)?)
                    }
                    None => (
                        transformer.forward(&latents, &timestep, positive)?,
                        transformer.forward(&latents, &timestep, negative)?,
                    ),
                };
                combine_cfg(&pos_pred, &neg_pred, config.guidance_scale)?
            }
        };

        if guided.dims() != latents.dims() {
            return Err(ZImageError::Inference(format!(
                "трансформер вернул {:?}, ожидалось {:?}",
                guided.dims(),
                latents.dims()
            )));
        }

        // Трансформер предсказывает скорость в обратную сторону.
        let model_output = guided.neg()?;
        latents = scheduler.step(&model_output, index, &latents)?;
        sync_barrier(&device)?;

        if debug_stats {
            let l = latents.to_dtype(DType::F32)?;
            let mean = l.mean_all()?.to_scalar::<f32>()?;
            let mean_sq = l.sqr()?.mean_all()?.to_scalar::<f32>()?;
            let std = (mean_sq - mean * mean).max(0.0).sqrt();
            debug!(step = index, t, mean, std, "latent");
        } else {
            debug!(step = index, t, "шаг денойзинга");
        }
    }

    Ok(latents)
}
