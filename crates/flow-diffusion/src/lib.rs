//! Flow-matching diffusion for Z-Image.
//!
//! - [`SchedulerConfig`]: diffusers `scheduler_config.json` with presets
//! - [`FlowMatchEulerScheduler`]: sigma/timestep schedule and the Euler step
//! - [`run_denoising`]: the guided denoising loop over a [`DiffusionTransformer`]

pub mod config;
pub mod denoise;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use denoise::{DenoiseConfig, DiffusionTransformer, PromptEmbeddings, combine_cfg, run_denoising};
pub use scheduler::{FlowMatchEulerScheduler, calculate_shift, time_shift};
