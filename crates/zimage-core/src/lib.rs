//! # zimage-core
//!
//! Базовые типы, трейты и определения ошибок для RustZImage.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Унифицированная обработка ошибок через [`ZImageError`]
//! - Конфигурации моделей пайплайна (VAE, трансформер, рекомендуемые параметры)
//! - Трейты внешних компонентов: токенайзер, текстовый энкодер, VAE
//! - Работа с устройством и барьеры синхронизации
//! - Аудит весов ([`weights_audit`])

pub mod config;
pub mod debug;
pub mod device;
pub mod error;
pub mod traits;
pub mod weights_audit;

pub use config::{ModelMetadata, TransformerConfig, VaeConfig};
pub use device::{create_device, sync_barrier};
pub use error::{ZImageError, ZImageResult};
pub use traits::{ChatMessage, ChatTokenizer, TextEncoder, VaeDecoder};
pub use weights_audit::{
    AuditSummary, TRANSFORMER_KEY_ALIASES, audit_weights, require_qk_norm_sentinels,
};
