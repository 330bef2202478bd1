//! Граница с языковой моделью.

use candle_core::{Device, IndexOp, Tensor};
use zimage_core::{ZImageError, ZImageResult};

use crate::cache::KvCache;

/// Causal language model driven by [`crate::TokenGenerator`].
///
/// Layer definitions and weights live in the implementation; the decode loop
/// only owns the per-layer caches and hands them in on every call.
pub trait CausalLm {
    /// Количество слоёв внимания (по одному KV-кешу на слой).
    fn num_hidden_layers(&self) -> usize;

    fn device(&self) -> &Device;

    /// `input_ids` `[1, seq]` → logits `[1, seq, vocab]`.
    ///
    /// Implementations append this call's keys/values to `caches` (one entry
    /// per layer) and use the cache offset as the rotary position.
    fn forward_causal(
        &self,
        input_ids: &Tensor,
        caches: &mut [Box<dyn KvCache>],
    ) -> ZImageResult<Tensor>;
}

impl<M: CausalLm + ?Sized> CausalLm for &M {
    fn num_hidden_layers(&self) -> usize {
        (**self).num_hidden_layers()
    }

    fn device(&self) -> &Device {
        (**self).device()
    }

    fn forward_causal(
        &self,
        input_ids: &Tensor,
        caches: &mut [Box<dyn KvCache>],
    ) -> ZImageResult<Tensor> {
        (**self).forward_causal(input_ids, caches)
    }
}

/// Logits of the last position: `[1, seq, vocab]` → `[vocab]`.
pub(crate) fn last_position_logits(logits: &Tensor) -> ZImageResult<Tensor> {
    let (batch, seq, _vocab) = logits.dims3().map_err(|_| {
        ZImageError::Inference(format!(
            "forward_causal должен вернуть [1, seq, vocab], получено {:?}",
            logits.dims()
        ))
    })?;
    if batch != 1 || seq == 0 {
        return Err(ZImageError::Inference(format!(
            "forward_causal: неожиданная форма logits {:?}",
            logits.dims()
        )));
    }
    Ok(logits.i((0, seq - 1))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_position_logits() {
        let logits = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap();
        let last = last_position_logits(&logits).unwrap();
        assert_eq!(last.to_vec1::<f32>().unwrap(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_last_position_logits_rejects_bad_shape() {
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            last_position_logits(&logits),
            Err(ZImageError::Inference(_))
        ));
    }
}
