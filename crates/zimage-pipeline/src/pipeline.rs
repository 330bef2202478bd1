use std::time::Instant;

use candle_core::{Device, Tensor};
use flow_diffusion::{DenoiseConfig, FlowMatchEulerScheduler, PromptEmbeddings, run_denoising};
use qwen_generation::{PromptEnhanceConfig, enhance_prompt};
use tracing::{debug, info, warn};
use zimage_core::{ChatTokenizer, TextEncoder, VaeDecoder, ZImageError, ZImageResult, sync_barrier};

use crate::loader::ModelLoader;
use crate::noise::initial_noise;
use crate::postprocess::{postprocess_image, to_rgb8};
use crate::request::GenerationRequest;
use crate::stage::Stage;

/// Результат генерации.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    /// `[1, 3, height, width]`, значения в `[0, 1]`.
    pub image: Tensor,
    /// Промпт, который реально ушёл в текстовый энкодер (после улучшения).
    pub prompt: String,
    pub width: usize,
    pub height: usize,
    pub seed: Option<u64>,
}

impl GeneratedImage {
    /// Interleaved RGB8, `height * width * 3` bytes.
    pub fn to_rgb8(&self) -> ZImageResult<Vec<u8>> {
        to_rgb8(&self.image)
    }
}

/// Z-Image text-to-image pipeline.
///
/// Stateless between requests: every call loads, uses and releases each
/// stage through the [`ModelLoader`].
pub struct ZImagePipeline<L> {
    loader: L,
}

impl<L: ModelLoader> ZImagePipeline<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn generate(&self, request: &GenerationRequest) -> ZImageResult<GeneratedImage> {
        request.validate()?;
        let started = Instant::now();
        let device = self.loader.device().clone();

        let scheduler_config = self.loader.scheduler_config()?;
        let transformer_config = self.loader.transformer_config()?;
        transformer_config.validate()?;
        let vae_config = self.loader.vae_config()?;
        info!(
            width = request.width,
            height = request.height,
            steps = request.steps,
            guidance = request.guidance_scale,
            in_channels = transformer_config.in_channels,
            n_layers = transformer_config.n_layers,
            "Z-Image generation"
        );

        // Stage 1: токенайзер + текстовый энкодер (и улучшение промпта).
        let tokenizer = self.loader.load_tokenizer()?;
        let (prompt, embeddings) = {
            let encoder = Stage::new(
                "text_encoder",
                self.loader.load_text_encoder()?,
                &device,
            );

            let mut prompt = request.prompt.clone();
            if request.enhance_prompt {
                info!(
                    max_tokens = request.enhance_max_tokens,
                    "улучшение промпта через LLM"
                );
                let config = PromptEnhanceConfig {
                    max_new_tokens: request.enhance_max_tokens,
                    seed: request.seed,
                    ..PromptEnhanceConfig::default()
                };
                let enhanced = enhance_prompt(&*encoder, &tokenizer, &request.prompt, &config)?;
                sync_barrier(&device)?;
                if enhanced.is_empty() {
                    warn!("улучшение промпта не завершено (не хватило токенов), используется исходный промпт");
                } else {
                    info!(enhanced = %enhanced, "промпт улучшен");
                    prompt = enhanced;
                }
            }

            let positive = encode_text(
                &*encoder,
                &tokenizer,
                &prompt,
                request.max_sequence_length,
                &device,
            )?;
            let negative = if request.uses_guidance() {
                let negative_prompt = request.negative_prompt.as_deref().unwrap_or("");
                Some(encode_text(
                    &*encoder,
                    &tokenizer,
                    negative_prompt,
                    request.max_sequence_length,
                    &device,
                )?)
            } else {
                None
            };
            sync_barrier(&device)?;
            (prompt, PromptEmbeddings::new(positive, negative))
        };
        drop(tokenizer);

        // Stage 2: денойзинг.
        let divisor = vae_config.latent_divisor();
        let latent_h = (request.height / divisor).max(1);
        let latent_w = (request.width / divisor).max(1);
        let noise = initial_noise(
            transformer_config.in_channels,
            latent_h,
            latent_w,
            request.seed,
            &device,
        )?;
        let mu = scheduler_config.mu_for_latent(latent_h, latent_w);
        let scheduler = FlowMatchEulerScheduler::new(request.steps, &scheduler_config, mu)?;
        debug!(latent_h, latent_w, ?mu, sigmas = ?scheduler.sigmas(), "расписание");

        let latents = {
            let transformer = Stage::new(
                "transformer",
                self.loader.load_transformer()?,
                &device,
            );
            run_denoising(
                &*transformer,
                noise,
                &embeddings,
                &scheduler,
                &DenoiseConfig {
                    guidance_scale: request.guidance_scale,
                },
            )?
        };
        drop(embeddings);

        // Stage 3: VAE.
        let image = {
            let vae = Stage::new("vae", self.loader.load_vae()?, &device);
            let decoded = vae.decode(&latents)?;
            postprocess_image(&decoded, request.height, request.width)?
        };

        info!(elapsed = ?started.elapsed(), "генерация завершена");
        Ok(GeneratedImage {
            image,
            prompt,
            width: request.width,
            height: request.height,
            seed: request.seed,
        })
    }
}

/// Tokenize and encode one prompt: `[1, seq, hidden]`.
fn encode_text<E, T>(
    encoder: &E,
    tokenizer: &T,
    prompt: &str,
    max_length: usize,
    device: &Device,
) -> ZImageResult<Tensor>
where
    E: TextEncoder + ?Sized,
    T: ChatTokenizer + ?Sized,
{
    let ids = tokenizer.encode_prompt(prompt, max_length)?;
    if ids.is_empty() {
        return Err(ZImageError::Tokenizer("пустая последовательность токенов".into()));
    }
    let input_ids = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
    sync_barrier(device)?;

    let embeds = encoder.encode(&input_ids)?;
    let (batch, seq, _) = embeds.dims3()?;
    if batch != 1 || seq == 0 {
        return Err(ZImageError::Inference(format!(
            "текстовый энкодер вернул {:?}",
            embeds.dims()
        )));
    }
    Ok(embeds)
}
