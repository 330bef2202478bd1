//! Autoregressive decode loop.
//!
//! `Prefill → Decode* → Stopped`: the whole prompt goes through the model
//! once, then every sampled token is fed back alone while the per-layer
//! caches carry the history.

use candle_core::{DType, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;
use zimage_core::{ZImageError, ZImageResult, sync_barrier};

use crate::cache::{DEFAULT_CACHE_STEP, new_layer_caches};
use crate::config::PromptEnhanceConfig;
use crate::model::{CausalLm, last_position_logits};
use crate::sampling::sample_token;

/// Почему генерация остановилась.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Сэмплирован EOS или стоп-токен.
    Eos,
    /// Достигнут лимит `max_new_tokens`.
    MaxTokens,
}

/// Token generator with its own sampling RNG.
///
/// Holds no per-request state besides the RNG: caches are created inside
/// each call, so one generator can serve requests one after another.
#[derive(Debug, Clone)]
pub struct TokenGenerator {
    rng: StdRng,
}

impl TokenGenerator {
    /// Детерминированный генератор.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded when `seed` is set, entropy otherwise.
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or_else(Self::from_entropy, Self::new)
    }

    /// Generate up to `config.max_new_tokens` tokens after `input_ids`.
    ///
    /// The loop bound is `config.sampling().max_tokens`, which mirrors
    /// `max_new_tokens`.
    ///
    /// Returns only the new tokens; the stop token itself is never included.
    pub fn generate<M: CausalLm + ?Sized>(
        &mut self,
        model: &M,
        input_ids: &[u32],
        config: &PromptEnhanceConfig,
    ) -> ZImageResult<Vec<u32>> {
        self.generate_with_reason(model, input_ids, config)
            .map(|(tokens, _)| tokens)
    }

    pub fn generate_with_reason<M: CausalLm + ?Sized>(
        &mut self,
        model: &M,
        input_ids: &[u32],
        config: &PromptEnhanceConfig,
    ) -> ZImageResult<(Vec<u32>, StopReason)> {
        config.validate()?;
        if input_ids.is_empty() {
            return Err(ZImageError::Config("пустой промпт для генерации".into()));
        }
        let sampling = config.sampling();
        let max_tokens = sampling.max_tokens;
        if max_tokens == 0 {
            return Ok((Vec::new(), StopReason::MaxTokens));
        }

        let debug_stats = zimage_core::debug::enabled();
        let device = model.device().clone();

        let mut caches = new_layer_caches(model.num_hidden_layers(), DEFAULT_CACHE_STEP);

        // Prefill: один проход по всему промпту заполняет кеши.
        let prompt = Tensor::new(input_ids, &device)?.unsqueeze(0)?;
        sync_barrier(&device)?;
        let logits = model.forward_causal(&prompt, &mut caches)?;
        sync_barrier(&device)?;
        let mut last_logits = last_position_logits(&logits)?;

        debug!(
            prompt_len = input_ids.len(),
            layers = caches.len(),
            "prefill завершён"
        );

        // История для штрафа за повторы: промпт + сгенерированное.
        let mut history = input_ids.to_vec();
        let mut generated = Vec::new();
        let mut stop_reason = StopReason::MaxTokens;

        while generated.len() < max_tokens {
            let token = sample_token(&last_logits, &sampling, &history, &mut self.rng)?;

            if debug_stats {
                let max_logit = last_logits
                    .to_dtype(DType::F32)?
                    .max(0)?
                    .to_scalar::<f32>()?;
                debug!(step = generated.len(), token, max_logit, "decode");
            }

            if config.is_stop_token(token) {
                stop_reason = StopReason::Eos;
                break;
            }

            generated.push(token);
            history.push(token);

            // Лимит исчерпан: ещё один forward не нужен.
            if generated.len() == max_tokens {
                break;
            }

            // Decode step: ровно один токен, история берётся из кешей.
            let next = Tensor::new(&[token], &device)?.unsqueeze(0)?;
            let logits = model.forward_causal(&next, &mut caches)?;
            sync_barrier(&device)?;
            last_logits = last_position_logits(&logits)?;
        }

        debug!(
            generated = generated.len(),
            ?stop_reason,
            "генерация завершена"
        );
        Ok((generated, stop_reason))
    }
}
