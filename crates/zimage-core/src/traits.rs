//! Трейты внешних компонентов пайплайна.
//!
//! Слои нейросетей, токенизация и загрузка весов живут вне ядра: ядро видит
//! их только через эти интерфейсы. Каждая реализация владеет своими весами,
//! поэтому освобождение памяти стадии сводится к `drop`.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::ZImageResult;

/// Одно сообщение чата (`system`, `user`, `assistant`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Токенайзер с чат-шаблоном.
pub trait ChatTokenizer {
    /// Закодировать диалог и добавить приглашение ассистента (`add_generation_prompt`).
    fn encode_chat_for_generation(
        &self,
        messages: &[ChatMessage],
        max_length: usize,
    ) -> ZImageResult<Vec<u32>>;

    /// Закодировать промпт для текстового энкодера.
    fn encode_prompt(&self, prompt: &str, max_length: usize) -> ZImageResult<Vec<u32>>;

    /// Декодировать id токенов в строку (без спец-токенов).
    fn decode(&self, token_ids: &[u32]) -> ZImageResult<String>;

    /// EOS-токен, если токенайзер его знает.
    fn eos_token_id(&self) -> Option<u32>;

    /// Максимальная длина последовательности.
    fn max_length(&self) -> usize;
}

/// Текстовый энкодер: `[1, seq]` id → эмбеддинги `[1, seq, hidden]`.
pub trait TextEncoder {
    fn encode(&self, input_ids: &Tensor) -> ZImageResult<Tensor>;
}

/// Декодер VAE: латент `[1, C, h, w]` → изображение `[1, 3, H, W]` в диапазоне `[-1, 1]`.
pub trait VaeDecoder {
    fn decode(&self, latents: &Tensor) -> ZImageResult<Tensor>;
}
