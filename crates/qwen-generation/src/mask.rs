//! Causal attention masks.

use candle_core::{DType, Device, Result, Tensor};

use crate::cache::KvCache;

/// Mask policy for one attention call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionMask {
    /// Query length 1: cached history already encodes causal order.
    None,
    /// Causal mask for `len` new query rows placed after `offset` cached positions.
    Causal { offset: usize, len: usize },
}

impl AttentionMask {
    /// Materialize the additive mask `[1, 1, len, offset + len]`, or `None`.
    pub fn to_tensor(&self, device: &Device, dtype: DType) -> Result<Option<Tensor>> {
        match *self {
            Self::None => Ok(None),
            Self::Causal { offset, len } => create_causal_mask(len, offset, device, dtype).map(Some),
        }
    }
}

/// Create an additive causal mask.
///
/// Row `i` corresponds to absolute position `offset + i` and may attend to
/// columns `0..=offset + i`. Returns shape `[1, 1, n, offset + n]` with `0.0`
/// for visible positions and `-inf` for future ones.
pub fn create_causal_mask(n: usize, offset: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let total = offset + n;
    let mask: Vec<f32> = (0..n)
        .flat_map(|i| {
            (0..total).map(move |j| if j <= offset + i { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();

    let mask = Tensor::from_vec(mask, (n, total), device)?;
    mask.unsqueeze(0)?.unsqueeze(0)?.to_dtype(dtype)
}

/// Pick the mask for a hidden-state sequence of length `n`.
///
/// With a cache the decision is delegated to [`KvCache::make_mask`]; without
/// one a single token needs no mask and longer inputs are causal from 0.
pub fn attention_mask_for(n: usize, cache: Option<&dyn KvCache>) -> AttentionMask {
    match cache {
        Some(cache) => cache.make_mask(n),
        None if n == 1 => AttentionMask::None,
        None => AttentionMask::Causal { offset: 0, len: n },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_without_offset() -> Result<()> {
        let mask = create_causal_mask(3, 0, &Device::Cpu, DType::F32)?;
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0][0], 0.0);
        assert_eq!(rows[0][1], f32::NEG_INFINITY);
        assert_eq!(rows[2][2], 0.0);
        assert_eq!(rows[1][2], f32::NEG_INFINITY);
        Ok(())
    }

    #[test]
    fn test_causal_mask_with_offset() -> Result<()> {
        // 2 новых позиции после 3 закешированных.
        let mask = create_causal_mask(2, 3, &Device::Cpu, DType::F32)?;
        assert_eq!(mask.dims(), &[1, 1, 2, 5]);
        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0, 0.0, f32::NEG_INFINITY]);
        assert_eq!(rows[1], vec![0.0; 5]);
        Ok(())
    }

    #[test]
    fn test_mask_policy_without_cache() {
        assert_eq!(attention_mask_for(1, None), AttentionMask::None);
        assert_eq!(
            attention_mask_for(4, None),
            AttentionMask::Causal { offset: 0, len: 4 }
        );
    }

    #[test]
    fn test_none_mask_materializes_to_none() -> Result<()> {
        assert!(AttentionMask::None.to_tensor(&Device::Cpu, DType::F32)?.is_none());
        Ok(())
    }
}
