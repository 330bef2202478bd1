//! Постобработка выхода VAE.

use candle_core::Tensor;
use zimage_core::{ZImageError, ZImageResult};

/// VAE output `[1, 3, h, w]` in `[-1, 1]` → image `[1, 3, height, width]` in `[0, 1]`.
///
/// A nearest-neighbour resize runs only when the decoded size differs from
/// the requested one (latent sizes round down to the VAE divisor).
pub fn postprocess_image(decoded: &Tensor, height: usize, width: usize) -> ZImageResult<Tensor> {
    let (_, channels, h, w) = decoded.dims4()?;
    if channels != 3 {
        return Err(ZImageError::Inference(format!(
            "VAE вернул {channels} каналов, ожидалось 3"
        )));
    }

    let image = if (h, w) != (height, width) {
        decoded.upsample_nearest2d(height, width)?
    } else {
        decoded.clone()
    };

    let image = ((image + 1.0)? / 2.0)?;
    Ok(image.clamp(0f32, 1f32)?)
}

/// `[1, 3, H, W]` in `[0, 1]` → interleaved RGB8 (`H * W * 3` bytes).
pub(crate) fn to_rgb8(image: &Tensor) -> ZImageResult<Vec<u8>> {
    let hwc = image
        .squeeze(0)?
        .permute((1, 2, 0))?
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?;
    Ok(hwc
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_denormalize_and_clamp() {
        let decoded = Tensor::new(&[-1f32, 0.0, 1.0, 3.0], &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 2, 2))
            .unwrap()
            .repeat((1, 3, 1, 1))
            .unwrap();
        let image = postprocess_image(&decoded, 2, 2).unwrap();
        let values = image.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(&values[..4], &[0.0, 0.5, 1.0, 1.0]);
    }

    #[test]
    fn test_nearest_resize_when_size_differs() {
        let decoded = Tensor::zeros((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let image = postprocess_image(&decoded, 5, 3).unwrap();
        assert_eq!(image.dims(), &[1, 3, 5, 3]);
    }

    #[test]
    fn test_rejects_non_rgb() {
        let decoded = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(postprocess_image(&decoded, 2, 2).is_err());
    }

    #[test]
    fn test_rgb8_layout() {
        // R=1, G=0, B=0.5 в каждом пикселе.
        let image = Tensor::new(&[1f32, 0.0, 0.5], &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 1, 1))
            .unwrap()
            .repeat((1, 1, 1, 2))
            .unwrap();
        assert_eq!(to_rgb8(&image).unwrap(), vec![255, 0, 128, 255, 0, 128]);
    }
}
