//! Выбор устройства и барьеры синхронизации.
//!
//! candle исполняет операции сразу, но на Metal/CUDA команды копятся в
//! очереди устройства. Циклы генерации вызывают [`sync_barrier`] в тех же
//! точках, где эталонная реализация форсирует вычисление графа: после
//! каждого forward-прохода декодера, после каждого шага денойзинга и на
//! границах стадий пайплайна. Так пиковое потребление памяти и место
//! возникновения ошибки остаются предсказуемыми.

use candle_core::Device;
use tracing::{debug, info};

use crate::{ZImageError, ZImageResult};

/// Максимальное количество compute encoder'ов на один command buffer.
///
/// Меньшее значение даёт более частый commit/flush: сотни шагов денойзинга
/// не накапливают длинную очередь команд.
const SAFE_COMPUTE_PER_BUFFER: &str = "16";

/// Настроить переменные окружения candle Metal.
///
/// **Вызывать ДО создания `Device::new_metal(...)`**, т.к. candle читает
/// переменные окружения при инициализации command pool.
///
/// Не перезаписывает переменные, если пользователь уже задал их явно.
pub fn configure_metal_env() {
    if std::env::var("CANDLE_METAL_COMPUTE_PER_BUFFER").is_err() {
        // SAFETY: вызывается до создания Metal device, потоков-потребителей нет.
        unsafe {
            std::env::set_var("CANDLE_METAL_COMPUTE_PER_BUFFER", SAFE_COMPUTE_PER_BUFFER);
        }
        debug!(
            "Metal: CANDLE_METAL_COMPUTE_PER_BUFFER={}",
            SAFE_COMPUTE_PER_BUFFER
        );
    }
}

/// Создать устройство по имени (`cpu`, `metal`, `cuda`).
///
/// Неизвестное имя считается ошибкой конфигурации, а не молчаливым
/// откатом на CPU.
pub fn create_device(name: &str) -> ZImageResult<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "metal" => {
            configure_metal_env();

            // candle может panic в процессе инициализации Metal (например, если устройство недоступно).
            // Панику ловим, а hook временно глушим, чтобы не засорять stderr.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => {
                    info!("Metal device инициализирован");
                    Ok(dev)
                }
                Ok(Err(e)) => Err(ZImageError::Device(format!(
                    "Metal device недоступен: {e}. Используйте --device cpu."
                ))),
                Err(_) => Err(ZImageError::Device(
                    "Panic при инициализации Metal. Используйте --device cpu.".into(),
                )),
            }
        }
        "cuda" => Device::new_cuda(0)
            .map_err(|e| ZImageError::Device(format!("CUDA device недоступен: {e}"))),
        other => Err(ZImageError::Config(format!(
            "Неизвестное устройство: {other} (ожидалось cpu, metal или cuda)"
        ))),
    }
}

/// Барьер вычислений.
///
/// Сбрасывает все pending операции устройства и ждёт их завершения.
/// На CPU ничего не делает.
#[inline]
pub fn sync_barrier(device: &Device) -> ZImageResult<()> {
    if device.is_metal() || device.is_cuda() {
        device
            .synchronize()
            .map_err(|e| ZImageError::Device(format!("Device sync failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_device() {
        let device = create_device("cpu").unwrap();
        assert!(device.is_cpu());
        sync_barrier(&device).unwrap();
    }

    #[test]
    fn test_unknown_device_is_config_error() {
        let err = create_device("tpu").unwrap_err();
        assert!(matches!(err, ZImageError::Config(_)));
    }
}
