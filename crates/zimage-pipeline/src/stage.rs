//! Scoped ownership of one pipeline stage.

use std::ops::Deref;

use candle_core::Device;
use tracing::{info, warn};
use zimage_core::sync_barrier;

/// A loaded model that lives for exactly one pipeline stage.
///
/// Dropping the guard releases the weights first and then waits for the
/// device, so the next stage never overlaps with this one in memory.
pub struct Stage<T> {
    // Поля удаляются в порядке объявления: сначала модель, потом барьер.
    model: T,
    release: ReleaseBarrier,
}

/// Синхронизация устройства после выгрузки модели стадии.
struct ReleaseBarrier {
    name: &'static str,
    device: Device,
}

impl Drop for ReleaseBarrier {
    fn drop(&mut self) {
        match sync_barrier(&self.device) {
            Ok(()) => info!(stage = self.name, "стадия выгружена"),
            Err(e) => warn!(stage = self.name, "синхронизация после выгрузки: {e}"),
        }
    }
}

impl<T> Stage<T> {
    pub fn new(name: &'static str, model: T, device: &Device) -> Self {
        info!(stage = name, "стадия загружена");
        Self {
            model,
            release: ReleaseBarrier {
                name,
                device: device.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        self.release.name
    }
}

impl<T> Deref for Stage<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.model
    }
}
