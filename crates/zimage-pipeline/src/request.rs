//! Запрос на генерацию.

use serde::{Deserialize, Serialize};
use zimage_core::{ModelMetadata, ZImageError, ZImageResult};

/// Параметры одной генерации. Значения по умолчанию рекомендованы для Z-Image Turbo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Используется только при `guidance_scale > 1` (иначе CFG выключен).
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    /// `None`: случайный шум.
    pub seed: Option<u64>,
    pub max_sequence_length: usize,
    /// Переписать промпт через LLM перед кодированием.
    pub enhance_prompt: bool,
    pub enhance_max_tokens: usize,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: None,
            width: ModelMetadata::RECOMMENDED_WIDTH,
            height: ModelMetadata::RECOMMENDED_HEIGHT,
            steps: ModelMetadata::RECOMMENDED_INFERENCE_STEPS,
            guidance_scale: ModelMetadata::RECOMMENDED_GUIDANCE_SCALE,
            seed: None,
            max_sequence_length: ModelMetadata::DEFAULT_MAX_SEQUENCE_LENGTH,
            enhance_prompt: false,
            enhance_max_tokens: 512,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// CFG включён при `guidance_scale > 1`; негативный промпт по умолчанию пустой.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn validate(&self) -> ZImageResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ZImageError::Config(format!(
                "размер изображения должен быть > 0, получено {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(ZImageError::Config("steps должен быть > 0".into()));
        }
        if !self.guidance_scale.is_finite() {
            return Err(ZImageError::Config(format!(
                "guidance_scale должен быть конечным, получено {}",
                self.guidance_scale
            )));
        }
        if self.max_sequence_length == 0 {
            return Err(ZImageError::Config("max_sequence_length должен быть > 0".into()));
        }
        if self.enhance_prompt && self.enhance_max_tokens == 0 {
            return Err(ZImageError::Config(
                "enhance_max_tokens должен быть > 0 при включённом улучшении".into(),
            ));
        }
        Ok(())
    }
}
