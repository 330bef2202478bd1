//! Конфигурационные структуры для моделей пайплайна.
//!
//! Поля названы так же, как в diffusers-конфигах (`transformer/config.json`,
//! `vae/config.json`), поэтому структуры читаются напрямую через `serde_json`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{ZImageError, ZImageResult};

/// Рекомендуемые параметры генерации для Z-Image Turbo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelMetadata;

impl ModelMetadata {
    pub const RECOMMENDED_WIDTH: usize = 1024;
    pub const RECOMMENDED_HEIGHT: usize = 1024;
    pub const RECOMMENDED_INFERENCE_STEPS: usize = 9;
    /// Turbo-модель дистиллирована без CFG.
    pub const RECOMMENDED_GUIDANCE_SCALE: f64 = 0.0;
    pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 512;
}

/// Конфигурация диффузионного трансформера (только то, что нужно пайплайну).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Количество каналов латента на входе.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,

    /// Количество слоёв (для логов и аудита весов).
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// RMSNorm над Q/K в attention; тогда в чекпоинте обязаны быть `norm_q`/`norm_k`.
    #[serde(default = "default_qk_norm")]
    pub qk_norm: bool,
}

fn default_in_channels() -> usize {
    16
}

fn default_n_layers() -> usize {
    30
}

fn default_qk_norm() -> bool {
    true
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            n_layers: default_n_layers(),
            qk_norm: default_qk_norm(),
        }
    }
}

impl TransformerConfig {
    pub fn validate(&self) -> ZImageResult<()> {
        if self.in_channels == 0 || self.n_layers == 0 {
            return Err(ZImageError::Config(format!(
                "некорректный конфиг трансформера: in_channels={}, n_layers={}",
                self.in_channels, self.n_layers
            )));
        }
        Ok(())
    }
}

/// Конфигурация VAE (AutoencoderKL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,

    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,

    #[serde(default)]
    pub shift_factor: Option<f64>,

    /// Каналы блоков энкодера/декодера; их количество задаёт пространственное сжатие.
    #[serde(default = "default_block_out_channels")]
    pub block_out_channels: Vec<usize>,
}

fn default_latent_channels() -> usize {
    16
}

fn default_scaling_factor() -> f64 {
    0.3611
}

fn default_block_out_channels() -> Vec<usize> {
    vec![128, 256, 512, 512]
}

impl Default for VaeConfig {
    fn default() -> Self {
        Self {
            latent_channels: default_latent_channels(),
            scaling_factor: default_scaling_factor(),
            shift_factor: Some(0.1159),
            block_out_channels: default_block_out_channels(),
        }
    }
}

impl VaeConfig {
    /// Пространственный делитель латента: `2^(len(block_out_channels) - 1)`.
    pub fn latent_divisor(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

/// Прочитать JSON-конфиг diffusers.
pub fn load_json_config<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> ZImageResult<T> {
    let content = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_json::from_str(&content)?)
}
