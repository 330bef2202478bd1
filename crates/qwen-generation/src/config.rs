//! Configuration for token generation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use zimage_core::{ZImageError, ZImageResult};

/// `<|im_end|>` в словаре Qwen.
pub const QWEN_IM_END: u32 = 151645;
/// `<|endoftext|>` в словаре Qwen.
pub const QWEN_END_OF_TEXT: u32 = 151643;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Maximum number of new tokens; the decode loop stops after this many.
    pub max_tokens: usize,

    /// Sampling temperature (`0.0` = greedy).
    pub temperature: f32,

    /// Nucleus threshold; values in `(0, 1)` enable top-p, `0.0` or `>= 1.0`
    /// disable it. Ignored by greedy decoding.
    pub top_p: f32,

    /// Repetition penalty (`None` or `1.0` disables it).
    pub repetition_penalty: Option<f32>,

    /// How many trailing tokens the penalty looks at.
    pub repetition_context_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: Some(1.05),
            repetition_context_size: 20,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding without penalty.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            temperature: 0.0,
            top_p: 1.0,
            repetition_penalty: None,
            repetition_context_size: 0,
        }
    }

    /// Reject malformed settings before the first forward pass.
    pub fn validate(&self) -> ZImageResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ZImageError::Config(format!(
                "temperature должна быть конечной и >= 0, получено {}",
                self.temperature
            )));
        }
        // При temperature == 0 top_p не участвует в выборе токена.
        if self.temperature > 0.0 && !(self.top_p.is_finite() && self.top_p >= 0.0) {
            return Err(ZImageError::Config(format!(
                "top_p должен быть конечным и >= 0, получено {}",
                self.top_p
            )));
        }
        if let Some(penalty) = self.repetition_penalty {
            if !penalty.is_finite() || penalty <= 0.0 {
                return Err(ZImageError::Config(format!(
                    "repetition_penalty должен быть конечным и > 0, получено {penalty}"
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for LLM prompt enhancement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEnhanceConfig {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub repetition_penalty: Option<f32>,
    pub repetition_context_size: usize,
    pub eos_token_id: u32,
    pub stop_token_ids: HashSet<u32>,
    /// Seed сэмплера; `None` берёт энтропию ОС.
    pub seed: Option<u64>,
}

impl Default for PromptEnhanceConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            repetition_penalty: Some(1.05),
            repetition_context_size: 20,
            eos_token_id: QWEN_IM_END,
            stop_token_ids: [QWEN_IM_END, QWEN_END_OF_TEXT].into_iter().collect(),
            seed: None,
        }
    }
}

impl PromptEnhanceConfig {
    /// Sampling part of the configuration.
    pub fn sampling(&self) -> GenerationConfig {
        GenerationConfig {
            max_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            repetition_penalty: self.repetition_penalty,
            repetition_context_size: self.repetition_context_size,
        }
    }

    /// `true` if generation must stop on `token`.
    pub fn is_stop_token(&self, token: u32) -> bool {
        token == self.eos_token_id || self.stop_token_ids.contains(&token)
    }

    pub fn validate(&self) -> ZImageResult<()> {
        self.sampling().validate()
    }
}
