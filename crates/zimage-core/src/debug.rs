//! Вспомогательные функции для отладочного вывода.

use std::sync::OnceLock;

/// Возвращает `true`, если включен подробный отладочный вывод.
///
/// Управляется переменной окружения `ZIMAGE_DEBUG` (любое непустое значение).
/// В этом режиме циклы генерации считают статистики тензоров на каждом шаге,
/// что требует чтения данных с устройства.
pub fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("ZIMAGE_DEBUG").is_some_and(|v| !v.is_empty()))
}
