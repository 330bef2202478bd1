//! Token sampling.
//!
//! Pure functions over a 1-D logit vector: no hidden state, randomness comes
//! from the caller's RNG so a seeded generator reproduces a run exactly.

use std::collections::BTreeSet;

use candle_core::{D, DType, Result, Tensor, bail};
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use crate::config::GenerationConfig;

/// Floor added to kept probabilities before sampling (keeps `log(0)` finite).
const NUCLEUS_FLOOR: f32 = 1e-10;

/// Penalize tokens from the recent context.
///
/// Negative logits are multiplied by `penalty`, non-negative ones divided by
/// it, so a penalty above 1 always pushes the token down. Each distinct id is
/// penalized once, however often it repeats in `tokens`.
pub fn apply_repetition_penalty(logits: &Tensor, tokens: &[u32], penalty: f32) -> Result<Tensor> {
    if tokens.is_empty() || penalty == 1.0 {
        return Ok(logits.clone());
    }

    let dtype = logits.dtype();
    let mut values = logits.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let unique: BTreeSet<u32> = tokens.iter().copied().collect();
    for id in unique {
        let Some(v) = values.get_mut(id as usize) else {
            bail!(
                "repetition penalty: token id {id} is outside vocab of {}",
                logits.dim(0)?
            );
        };
        *v = if *v < 0.0 { *v * penalty } else { *v / penalty };
    }

    let len = values.len();
    Tensor::from_vec(values, len, logits.device())?.to_dtype(dtype)
}

/// Index of the maximum logit.
pub fn argmax_sample(logits: &Tensor) -> Result<u32> {
    logits.argmax(D::Minus1)?.to_scalar::<u32>()
}

/// Nucleus (top-p) sampling.
pub fn top_p_sample<R: Rng + ?Sized>(
    logits: &Tensor,
    temperature: f32,
    top_p: f32,
    rng: &mut R,
) -> Result<u32> {
    let probs = softmax_with_temperature(logits, temperature)?;

    // Стабильная сортировка по возрастанию: равные вероятности сохраняют порядок индексов.
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));
    let sorted: Vec<f32> = order.iter().map(|&i| probs[i]).collect();

    let weights: Vec<f32> = top_p_filter(&sorted, top_p)
        .into_iter()
        .map(|p| p + NUCLEUS_FLOOR)
        .collect();
    let dist = WeightedIndex::new(&weights).map_err(candle_core::Error::wrap)?;
    Ok(order[dist.sample(rng)] as u32)
}

/// Plain categorical sampling from `softmax(logits / temperature)`.
pub fn categorical_sample<R: Rng + ?Sized>(
    logits: &Tensor,
    temperature: f32,
    rng: &mut R,
) -> Result<u32> {
    let probs = softmax_with_temperature(logits, temperature)?;
    let dist = WeightedIndex::new(&probs).map_err(candle_core::Error::wrap)?;
    Ok(dist.sample(rng) as u32)
}

/// Choose the next token.
///
/// The repetition penalty (if configured and the history is non-empty) is
/// applied first, then exactly one strategy runs: greedy for
/// `temperature == 0`, nucleus for `0 < top_p < 1`, categorical otherwise.
pub fn sample_token<R: Rng + ?Sized>(
    logits: &Tensor,
    config: &GenerationConfig,
    previous_tokens: &[u32],
    rng: &mut R,
) -> Result<u32> {
    let mut logits = logits.clone();

    if let Some(penalty) = config.repetition_penalty {
        if !previous_tokens.is_empty() {
            let start = previous_tokens
                .len()
                .saturating_sub(config.repetition_context_size);
            logits = apply_repetition_penalty(&logits, &previous_tokens[start..], penalty)?;
        }
    }

    if config.temperature == 0.0 {
        argmax_sample(&logits)
    } else if config.top_p > 0.0 && config.top_p < 1.0 {
        top_p_sample(&logits, config.temperature, config.top_p, rng)
    } else {
        categorical_sample(&logits, config.temperature, rng)
    }
}

/// Zero every ascending-sorted probability whose cumulative mass is not
/// strictly above `1 - top_p`.
///
/// The surviving tail is the highest-probability mass summing to at least
/// `top_p`; an entry whose cumulative sum lands exactly on the threshold is
/// dropped.
pub(crate) fn top_p_filter(sorted_ascending: &[f32], top_p: f32) -> Vec<f32> {
    let threshold = 1.0 - top_p;
    let mut cumulative = 0f32;
    sorted_ascending
        .iter()
        .map(|&p| {
            cumulative += p;
            if cumulative > threshold { p } else { 0.0 }
        })
        .collect()
}

fn softmax_with_temperature(logits: &Tensor, temperature: f32) -> Result<Vec<f32>> {
    // bf16/f16 логиты сначала переводим в f32.
    let logits = logits.to_dtype(DType::F32)?;
    let scaled = (logits / temperature as f64)?;
    candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec1::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn log_probs(probs: &[f32]) -> Tensor {
        let values: Vec<f32> = probs.iter().map(|p| p.ln()).collect();
        logits(&values)
    }

    fn histogram(samples: impl Iterator<Item = u32>, vocab: usize) -> Vec<f64> {
        let mut counts = vec![0usize; vocab];
        let mut total = 0;
        for s in samples {
            counts[s as usize] += 1;
            total += 1;
        }
        counts.iter().map(|&c| c as f64 / total as f64).collect()
    }

    #[test]
    fn test_penalty_one_is_identity() -> Result<()> {
        let l = logits(&[1.5, -0.5, 0.0, 3.0]);
        let out = apply_repetition_penalty(&l, &[0, 1, 2, 3], 1.0)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![1.5, -0.5, 0.0, 3.0]);

        let out = apply_repetition_penalty(&l, &[], 2.0)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![1.5, -0.5, 0.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_penalty_signs_and_duplicates() -> Result<()> {
        let l = logits(&[2.0, -2.0, 0.5, 1.0]);
        // Токен 1 встречается дважды, но штрафуется один раз.
        let out = apply_repetition_penalty(&l, &[0, 1, 1], 2.0)?;
        assert_eq!(out.to_vec1::<f32>()?, vec![1.0, -4.0, 0.5, 1.0]);
        Ok(())
    }

    #[test]
    fn test_penalty_rejects_out_of_vocab() {
        let l = logits(&[0.0, 1.0]);
        assert!(apply_repetition_penalty(&l, &[5], 1.1).is_err());
    }

    #[test]
    fn test_penalty_keeps_dtype() -> Result<()> {
        let l = logits(&[1.0, -1.0]).to_dtype(DType::BF16)?;
        let out = apply_repetition_penalty(&l, &[0], 2.0)?;
        assert_eq!(out.dtype(), DType::BF16);
        Ok(())
    }

    #[test]
    fn test_greedy_is_argmax_regardless_of_top_p() -> Result<()> {
        let l = logits(&[0.1, 5.0, -3.0, 4.9]);
        let mut rng = StdRng::seed_from_u64(0);
        for top_p in [0.1, 0.5, 0.9, 1.0] {
            let config = GenerationConfig {
                temperature: 0.0,
                top_p,
                repetition_penalty: Some(1.3),
                repetition_context_size: 4,
                ..GenerationConfig::default()
            };
            // Штраф на токен 2 не меняет максимум.
            assert_eq!(sample_token(&l, &config, &[2], &mut rng)?, 1);
            assert_eq!(sample_token(&l, &config, &[], &mut rng)?, 1);
        }
        Ok(())
    }

    #[test]
    fn test_penalty_applies_before_greedy() -> Result<()> {
        let l = logits(&[3.0, 2.9]);
        let config = GenerationConfig {
            temperature: 0.0,
            repetition_penalty: Some(1.5),
            repetition_context_size: 1,
            ..GenerationConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        // Контекст: только последний токен (0): 3.0 / 1.5 = 2.0 < 2.9.
        assert_eq!(sample_token(&l, &config, &[1, 0], &mut rng)?, 1);
        // Последний токен 1: штрафуется уже он.
        assert_eq!(sample_token(&l, &config, &[0, 1], &mut rng)?, 0);
        Ok(())
    }

    #[test]
    fn test_top_p_filter_boundary_is_strict() {
        let sorted = [0.125, 0.125, 0.25, 0.5];
        // Порог 0.25: кумулятивная сумма второго элемента равна порогу и отбрасывается.
        assert_eq!(top_p_filter(&sorted, 0.75), vec![0.0, 0.0, 0.25, 0.5]);
        assert_eq!(top_p_filter(&sorted, 0.8), vec![0.0, 0.125, 0.25, 0.5]);
        assert_eq!(top_p_filter(&sorted, 0.5), vec![0.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn test_top_p_only_samples_nucleus() -> Result<()> {
        // Порог 0.35 оставляет токены с вероятностями 0.3 и 0.4.
        let l = log_probs(&[0.4, 0.1, 0.3, 0.2]);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let t = top_p_sample(&l, 1.0, 0.65, &mut rng)?;
            assert!(t == 0 || t == 2, "токен {t} вне ядра");
        }
        Ok(())
    }

    #[test]
    fn test_top_p_near_one_matches_categorical() -> Result<()> {
        let probs = [0.1f32, 0.2, 0.3, 0.4];
        let l = log_probs(&probs);
        let n = 20_000;

        let mut rng = StdRng::seed_from_u64(7);
        let nucleus = histogram(
            (0..n).map(|_| top_p_sample(&l, 1.0, 0.999_999, &mut rng).unwrap()),
            4,
        );
        let mut rng = StdRng::seed_from_u64(8);
        let plain = histogram(
            (0..n).map(|_| categorical_sample(&l, 1.0, &mut rng).unwrap()),
            4,
        );

        for i in 0..4 {
            assert!((nucleus[i] - probs[i] as f64).abs() < 0.02, "nucleus {nucleus:?}");
            assert!((plain[i] - probs[i] as f64).abs() < 0.02, "plain {plain:?}");
        }
        Ok(())
    }

    #[test]
    fn test_seeded_sampling_is_reproducible() -> Result<()> {
        let l = logits(&[0.3, 0.1, 0.9, -0.2, 0.5]);
        let config = GenerationConfig::default();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..32)
                .map(|_| sample_token(&l, &config, &[1, 2], &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(123), run(123));
        Ok(())
    }

    #[test]
    fn test_temperature_sharpens_distribution() -> Result<()> {
        let l = logits(&[2.0, 1.0, 0.0]);
        let mut rng = StdRng::seed_from_u64(3);
        let cold = histogram(
            (0..2000).map(|_| categorical_sample(&l, 0.1, &mut rng).unwrap()),
            3,
        );
        assert!(cold[0] > 0.99);
        Ok(())
    }
}
