//! Autoregressive Qwen generation for prompt enhancement.
//!
//! This crate drives a causal language model token by token: per-layer
//! growable KV caches, a configurable sampler (greedy, nucleus, categorical
//! with repetition penalty) and the decode loop that ties them together.
//! The model itself is consumed through the [`CausalLm`] trait.

pub mod cache;
pub mod config;
pub mod enhance;
pub mod generate;
pub mod mask;
pub mod model;
pub mod sampling;

pub use cache::{KvCache, SimpleKvCache};
pub use config::{GenerationConfig, PromptEnhanceConfig};
pub use enhance::{PE_SYSTEM_PROMPT, enhance_prompt, strip_think_block};
pub use generate::{StopReason, TokenGenerator};
pub use mask::{AttentionMask, create_causal_mask};
pub use model::CausalLm;
