//! Загрузка компонентов пайплайна.

use candle_core::Device;
use flow_diffusion::{DiffusionTransformer, SchedulerConfig};
use qwen_generation::CausalLm;
use zimage_core::{
    ChatTokenizer, TextEncoder, TransformerConfig, VaeConfig, VaeDecoder, ZImageResult,
};

/// Source of the pipeline's components.
///
/// Each `load_*` call is expected to build the component from scratch (read
/// weights, remap keys, quantize); the pipeline calls it right before the
/// stage that needs it and drops the result right after.
pub trait ModelLoader {
    type Tokenizer: ChatTokenizer;
    /// Qwen: кодирует промпт и генерирует текст для улучшения промпта.
    type TextEncoder: TextEncoder + CausalLm;
    type Transformer: DiffusionTransformer;
    type Vae: VaeDecoder;

    fn device(&self) -> &Device;

    fn scheduler_config(&self) -> ZImageResult<SchedulerConfig>;

    /// `transformer/config.json`; `in_channels` задаёт число каналов шума.
    fn transformer_config(&self) -> ZImageResult<TransformerConfig>;

    fn vae_config(&self) -> ZImageResult<VaeConfig>;

    fn load_tokenizer(&self) -> ZImageResult<Self::Tokenizer>;

    fn load_text_encoder(&self) -> ZImageResult<Self::TextEncoder>;

    fn load_transformer(&self) -> ZImageResult<Self::Transformer>;

    fn load_vae(&self) -> ZImageResult<Self::Vae>;
}
