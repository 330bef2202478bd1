//! Scheduler configuration.
//!
//! Mirrors diffusers' `scheduler_config.json` for
//! `FlowMatchEulerDiscreteScheduler`; unknown keys (`_class_name`, ...) are
//! ignored.

use std::path::Path;

use serde::{Deserialize, Serialize};
use zimage_core::config::load_json_config;
use zimage_core::{ZImageError, ZImageResult};

use crate::scheduler::calculate_shift;

/// Значения по умолчанию для динамического сдвига, если их нет в конфиге.
pub const DEFAULT_BASE_IMAGE_SEQ_LEN: usize = 256;
pub const DEFAULT_MAX_IMAGE_SEQ_LEN: usize = 4096;
pub const DEFAULT_BASE_SHIFT: f64 = 0.5;
pub const DEFAULT_MAX_SHIFT: f64 = 1.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of training timesteps (default: 1000).
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,

    /// Static shift (default: 1.0, i.e. no shift).
    #[serde(default = "default_shift")]
    pub shift: f64,

    /// Resolution-dependent shift instead of the static one.
    #[serde(default)]
    pub use_dynamic_shifting: bool,

    #[serde(default)]
    pub base_shift: Option<f64>,
    #[serde(default)]
    pub max_shift: Option<f64>,
    #[serde(default)]
    pub base_image_seq_len: Option<usize>,
    #[serde(default)]
    pub max_image_seq_len: Option<usize>,
}

fn default_num_train_timesteps() -> usize {
    1000
}
fn default_shift() -> f64 {
    1.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::z_image_turbo()
    }
}

impl SchedulerConfig {
    /// Z-Image Turbo: static shift 3.0.
    pub fn z_image_turbo() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 3.0,
            use_dynamic_shifting: false,
            base_shift: None,
            max_shift: None,
            base_image_seq_len: None,
            max_image_seq_len: None,
        }
    }

    /// Dynamic shifting with the usual 256..4096 / 0.5..1.15 interpolation.
    pub fn dynamic() -> Self {
        Self {
            num_train_timesteps: 1000,
            shift: 1.0,
            use_dynamic_shifting: true,
            base_shift: Some(DEFAULT_BASE_SHIFT),
            max_shift: Some(DEFAULT_MAX_SHIFT),
            base_image_seq_len: Some(DEFAULT_BASE_IMAGE_SEQ_LEN),
            max_image_seq_len: Some(DEFAULT_MAX_IMAGE_SEQ_LEN),
        }
    }

    /// Загрузить `scheduler_config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> ZImageResult<Self> {
        let config: Self = load_json_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ZImageResult<()> {
        if self.num_train_timesteps == 0 {
            return Err(ZImageError::Config(
                "num_train_timesteps должен быть > 0".into(),
            ));
        }
        if !self.shift.is_finite() || self.shift <= 0.0 {
            return Err(ZImageError::Config(format!(
                "shift должен быть конечным и > 0, получено {}",
                self.shift
            )));
        }
        if self.base_image_seq_len() == self.max_image_seq_len() {
            return Err(ZImageError::Config(
                "base_image_seq_len и max_image_seq_len совпадают".into(),
            ));
        }
        Ok(())
    }

    pub fn base_shift(&self) -> f64 {
        self.base_shift.unwrap_or(DEFAULT_BASE_SHIFT)
    }

    pub fn max_shift(&self) -> f64 {
        self.max_shift.unwrap_or(DEFAULT_MAX_SHIFT)
    }

    pub fn base_image_seq_len(&self) -> usize {
        self.base_image_seq_len.unwrap_or(DEFAULT_BASE_IMAGE_SEQ_LEN)
    }

    pub fn max_image_seq_len(&self) -> usize {
        self.max_image_seq_len.unwrap_or(DEFAULT_MAX_IMAGE_SEQ_LEN)
    }

    /// `mu` for a latent of `latent_h × latent_w`, or `None` without dynamic shifting.
    pub fn mu_for_latent(&self, latent_h: usize, latent_w: usize) -> Option<f64> {
        self.use_dynamic_shifting.then(|| {
            calculate_shift(
                latent_h * latent_w,
                self.base_image_seq_len(),
                self.max_image_seq_len(),
                self.base_shift(),
                self.max_shift(),
            )
        })
    }
}
