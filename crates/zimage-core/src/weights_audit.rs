//! Аудит соответствия весов чекпоинта параметрам модели.
//!
//! Загрузчики весов внешние, но перед стадией полезно убедиться, что
//! чекпоинт покрывает модель: недостающие ключи молча превращаются в
//! нулевые/случайные веса и дают «шумное» изображение без явной ошибки.

use std::collections::{BTreeSet, HashMap};

use tracing::{info, warn};

use crate::{TransformerConfig, ZImageError, ZImageResult};

/// Альтернативные имена ключей трансформера: `(параметр модели, ключ чекпоинта)`.
///
/// Single-file (AIO) чекпоинты хранят caption-эмбеддер как `nn.Sequential`
/// (`cap_embedder.0` = RMSNorm, `cap_embedder.1` = Linear).
pub const TRANSFORMER_KEY_ALIASES: &[(&str, &str)] = &[
    ("cap_embed_norm.weight", "cap_embedder.0.weight"),
    ("cap_embed_linear.weight", "cap_embedder.1.weight"),
    ("cap_embed_linear.bias", "cap_embedder.1.bias"),
];

/// Ключи первого слоя, без которых qk-norm трансформер тихо работает без нормализации.
const QK_NORM_SENTINELS: &[&str] = &[
    "layers.0.attention.norm_q.weight",
    "layers.0.attention.norm_k.weight",
];

/// Итог аудита.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSummary {
    pub matched: usize,
    /// Ожидаемые ключи, которых нет в чекпоинте (с учётом префикса).
    pub missing: Vec<String>,
    /// Ключи чекпоинта, не использованные моделью (отсортированы).
    pub extra: Vec<String>,
}

impl AuditSummary {
    /// Доля найденных параметров модели.
    pub fn coverage(&self) -> f64 {
        let total = self.matched + self.missing.len();
        if total == 0 {
            return 1.0;
        }
        self.matched as f64 / total as f64
    }

    /// Ошибка, если покрытие ниже `minimum`.
    pub fn ensure_coverage(&self, minimum: f64) -> ZImageResult<()> {
        let coverage = self.coverage();
        if coverage < minimum {
            return Err(ZImageError::WeightsMissing(format!(
                "покрытие весов {:.1}% ниже требуемого {:.1}% (нет {} ключей)",
                coverage * 100.0,
                minimum * 100.0,
                self.missing.len()
            )));
        }
        Ok(())
    }
}

/// Сравнить имена параметров модели с ключами чекпоинта.
///
/// Ключ параметра ищется сначала как `{prefix}.{key}`, затем как есть; если
/// не найден, то же самое для его псевдонимов из `aliases`.
/// В лог попадает не более `sample` примеров недостающих и лишних ключей.
pub fn audit_weights<'a, T>(
    expected: impl IntoIterator<Item = &'a str>,
    weights: &HashMap<String, T>,
    prefix: &str,
    aliases: &[(&'a str, &'a str)],
    sample: usize,
) -> AuditSummary {
    let mut matched = 0;
    let mut missing = Vec::new();
    let mut remaining: BTreeSet<&str> = weights.keys().map(String::as_str).collect();

    for key in expected {
        let found = std::iter::once(key)
            .chain(aliases.iter().filter(|(k, _)| *k == key).map(|(_, a)| *a))
            .find_map(|candidate| resolve_key(weights, prefix, candidate));
        match found {
            Some(actual) => {
                remaining.remove(actual);
                matched += 1;
            }
            None => missing.push(prefixed_key(prefix, key)),
        }
    }

    let extra: Vec<String> = remaining.into_iter().map(str::to_string).collect();

    let label = if prefix.is_empty() { "module" } else { prefix };
    info!(
        "{} weights audit -> matched: {}, missing: {}, extra: {}",
        label,
        matched,
        missing.len(),
        extra.len()
    );
    if !missing.is_empty() {
        warn!("Missing weights: {}{}", missing.len(), sample_text(&missing, sample));
    }
    if !extra.is_empty() {
        info!("Extra weights: {}{}", extra.len(), sample_text(&extra, sample));
    }

    AuditSummary {
        matched,
        missing,
        extra,
    }
}

/// Строгая проверка трансформер-чекпоинта: при `qk_norm` обязаны быть
/// `norm_q`/`norm_k` первого слоя. Ошибка перечисляет все отсутствующие ключи.
pub fn require_qk_norm_sentinels<T>(
    weights: &HashMap<String, T>,
    prefix: &str,
    config: &TransformerConfig,
) -> ZImageResult<()> {
    if !config.qk_norm {
        return Ok(());
    }
    let missing: Vec<String> = QK_NORM_SENTINELS
        .iter()
        .filter(|key| resolve_key(weights, prefix, key).is_none())
        .map(|key| prefixed_key(prefix, key))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ZImageError::WeightsMissing(format!(
            "qk_norm включён, но в чекпоинте нет: {}",
            missing.join(", ")
        )))
    }
}

/// Ключ чекпоинта для `key`: `{prefix}.{key}` или сам `key`.
fn resolve_key<'w, T>(weights: &'w HashMap<String, T>, prefix: &str, key: &str) -> Option<&'w str> {
    let prefixed = prefixed_key(prefix, key);
    weights
        .get_key_value(prefixed.as_str())
        .or_else(|| weights.get_key_value(key))
        .map(|(k, _)| k.as_str())
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn sample_text(keys: &[String], sample: usize) -> String {
    if sample == 0 || keys.is_empty() {
        return String::new();
    }
    let shown: Vec<&str> = keys.iter().take(sample).map(String::as_str).collect();
    let suffix = if keys.len() > shown.len() { ", ..." } else { "" };
    format!(" (sample: {}{})", shown.join(", "), suffix)
}
