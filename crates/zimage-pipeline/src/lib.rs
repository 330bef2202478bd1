//! Z-Image Pipeline - end-to-end text-to-image generation.
//!
//! Stages run strictly one after another: text encoder (with optional
//! prompt enhancement), diffusion transformer, VAE. Each stage's weights are
//! released before the next stage loads.

mod loader;
mod noise;
mod pipeline;
mod postprocess;
mod request;
mod stage;
mod tokenizer;

pub use loader::ModelLoader;
pub use noise::initial_noise;
pub use pipeline::{GeneratedImage, ZImagePipeline};
pub use postprocess::postprocess_image;
pub use request::GenerationRequest;
pub use stage::Stage;
pub use tokenizer::QwenChatTokenizer;
