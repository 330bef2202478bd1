//! Токенайзер Qwen с чат-шаблоном ChatML.
//!
//! Сам BPE делегируется `tokenizers` (`tokenizer.json` из снапшота модели);
//! здесь только форматирование диалога и усечение:
//!
//! ```text
//! <|im_start|>system\n...<|im_end|>\n<|im_start|>user\n...<|im_end|>\n<|im_start|>assistant\n
//! ```
//!
//! Спец-токены ChatML присутствуют в тексте и распознаются как added tokens,
//! поэтому кодирование идёт с `add_special_tokens = false`.

use std::path::Path;

use tokenizers::Tokenizer;
use tracing::debug;
use zimage_core::{ChatMessage, ChatTokenizer, ModelMetadata, ZImageError, ZImageResult};

const IM_START: &str = "<|im_start|>";
const IM_END: &str = "<|im_end|>";

pub struct QwenChatTokenizer {
    inner: Tokenizer,
    max_length: usize,
    eos_token_id: Option<u32>,
}

impl QwenChatTokenizer {
    pub fn new(inner: Tokenizer, max_length: usize) -> Self {
        let eos_token_id = inner.token_to_id(IM_END);
        Self {
            inner,
            max_length,
            eos_token_id,
        }
    }

    pub fn from_file(path: impl AsRef<Path>, max_length: usize) -> ZImageResult<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            ZImageError::Tokenizer(format!("Cannot load tokenizer {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "токенайзер загружен");
        Ok(Self::new(inner, max_length))
    }

    /// `tokenizer/tokenizer.json` (раскладка diffusers) или `tokenizer.json` в корне.
    pub fn from_model_dir(model_dir: impl AsRef<Path>) -> ZImageResult<Self> {
        let model_dir = model_dir.as_ref();
        let nested = model_dir.join("tokenizer").join("tokenizer.json");
        let path = if nested.exists() {
            nested
        } else {
            model_dir.join("tokenizer.json")
        };
        if !path.exists() {
            return Err(ZImageError::Tokenizer(format!(
                "tokenizer.json не найден в {}",
                model_dir.display()
            )));
        }
        Self::from_file(path, ModelMetadata::DEFAULT_MAX_SEQUENCE_LENGTH)
    }

    fn encode_text(&self, text: &str, max_length: usize) -> ZImageResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ZImageError::Tokenizer(format!("Tokenizer encode error: {e}")))?;
        let mut ids = encoding.get_ids().to_vec();
        if ids.len() > max_length {
            debug!(len = ids.len(), max_length, "промпт усечён");
            ids.truncate(max_length);
        }
        Ok(ids)
    }
}

/// Render messages in ChatML, optionally opening the assistant turn.
pub(crate) fn format_chat(messages: &[ChatMessage], add_generation_prompt: bool) -> String {
    let mut text = String::new();
    for message in messages {
        text.push_str(IM_START);
        text.push_str(&message.role);
        text.push('\n');
        text.push_str(&message.content);
        text.push_str(IM_END);
        text.push('\n');
    }
    if add_generation_prompt {
        text.push_str(IM_START);
        text.push_str("assistant\n");
    }
    text
}

/// Prompt for the text encoder: one user turn and an empty thinking block.
pub(crate) fn format_encoder_prompt(prompt: &str) -> String {
    let mut text = format_chat(&[ChatMessage::user(prompt)], true);
    text.push_str("<think>\n\n</think>\n\n");
    text
}

impl ChatTokenizer for QwenChatTokenizer {
    fn encode_chat_for_generation(
        &self,
        messages: &[ChatMessage],
        max_length: usize,
    ) -> ZImageResult<Vec<u32>> {
        self.encode_text(&format_chat(messages, true), max_length)
    }

    fn encode_prompt(&self, prompt: &str, max_length: usize) -> ZImageResult<Vec<u32>> {
        self.encode_text(&format_encoder_prompt(prompt), max_length)
    }

    fn decode(&self, token_ids: &[u32]) -> ZImageResult<String> {
        self.inner
            .decode(token_ids, true)
            .map_err(|e| ZImageError::Tokenizer(format!("Tokenizer decode error: {e}")))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn max_length(&self) -> usize {
        self.max_length
    }
}
