//! KV-кеш для авторегрессивной генерации.
//!
//! Каждый слой внимания владеет своим кешем в формате
//! `[batch, kv_heads, capacity, head_dim]`. Буфер растёт блоками по `step`
//! позиций, чтобы decode-шаг не копировал всю историю на каждом токене.
//! Наружу всегда отдаются только валидные позиции `[0, offset)`.

use candle_core::{Result, Tensor, bail};

use crate::mask::AttentionMask;

/// Шаг роста буфера по умолчанию.
pub const DEFAULT_CACHE_STEP: usize = 256;

/// Интерфейс кеша одного слоя внимания.
///
/// Декодер работает только через этот trait, поэтому варианты со
/// скользящим окном или вытеснением подключаются без изменения цикла генерации.
pub trait KvCache: Send {
    /// Количество валидных позиций.
    fn offset(&self) -> usize;

    /// Дописать K/V формы `[batch, kv_heads, n, head_dim]` и вернуть
    /// накопленные K/V по всем валидным позициям.
    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Политика маски для `n` новых позиций запроса.
    fn make_mask(&self, n: usize) -> AttentionMask;

    /// Сбросить кеш перед новым запросом.
    fn reset(&mut self);
}

/// Простой растущий кеш.
#[derive(Debug, Clone)]
pub struct SimpleKvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
    offset: usize,
    step: usize,
}

impl Default for SimpleKvCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_STEP)
    }
}

impl SimpleKvCache {
    pub fn new(step: usize) -> Self {
        Self {
            keys: None,
            values: None,
            offset: 0,
            step: step.max(1),
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Размер выделенного буфера по оси времени (0, если буфера нет).
    pub fn capacity(&self) -> usize {
        self.keys
            .as_ref()
            .and_then(|k| k.dim(2).ok())
            .unwrap_or(0)
    }

    fn grow(&mut self, keys: &Tensor, values: &Tensor) -> Result<()> {
        let previous = self.offset;
        let (b, kv_heads, n, k_head_dim) = keys.dims4()?;
        let v_head_dim = values.dim(3)?;

        let n_steps = n.div_ceil(self.step);
        let new_k = Tensor::zeros(
            (b, kv_heads, n_steps * self.step, k_head_dim),
            keys.dtype(),
            keys.device(),
        )?;
        let new_v = Tensor::zeros(
            (b, kv_heads, n_steps * self.step, v_head_dim),
            values.dtype(),
            values.device(),
        )?;

        match (self.keys.take(), self.values.take()) {
            (Some(mut cur_k), Some(mut cur_v)) => {
                // Хвост старого буфера после `previous` не используется.
                // Если его не отрезать, после конкатенации он окажется
                // внутри валидной истории.
                if previous % self.step != 0 {
                    cur_k = cur_k.narrow(2, 0, previous)?;
                    cur_v = cur_v.narrow(2, 0, previous)?;
                }
                self.keys = Some(Tensor::cat(&[&cur_k, &new_k], 2)?);
                self.values = Some(Tensor::cat(&[&cur_v, &new_v], 2)?);
            }
            _ => {
                self.keys = Some(new_k);
                self.values = Some(new_v);
            }
        }
        Ok(())
    }
}

impl KvCache for SimpleKvCache {
    fn offset(&self) -> usize {
        self.offset
    }

    fn update(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let (kb, kh, n, _) = keys.dims4()?;
        let (vb, vh, vn, _) = values.dims4()?;
        if (kb, kh, n) != (vb, vh, vn) {
            bail!(
                "kv cache: keys {:?} and values {:?} disagree on batch/heads/seq",
                keys.dims(),
                values.dims()
            );
        }

        let previous = self.offset;
        let needs_grow = match &self.keys {
            Some(k) => previous + n > k.dim(2)?,
            None => true,
        };
        if needs_grow {
            self.grow(keys, values)?;
        }

        let (Some(all_k), Some(all_v)) = (&self.keys, &self.values) else {
            bail!("kv cache: buffer is not allocated after grow");
        };
        all_k.slice_set(&keys.contiguous()?, 2, previous)?;
        all_v.slice_set(&values.contiguous()?, 2, previous)?;
        self.offset += n;

        Ok((
            all_k.narrow(2, 0, self.offset)?,
            all_v.narrow(2, 0, self.offset)?,
        ))
    }

    fn make_mask(&self, n: usize) -> AttentionMask {
        if n == 1 {
            AttentionMask::None
        } else {
            AttentionMask::Causal {
                offset: self.offset,
                len: n,
            }
        }
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
        self.offset = 0;
    }
}

/// Создать по одному независимому кешу на каждый слой.
pub fn new_layer_caches(num_layers: usize, step: usize) -> Vec<Box<dyn KvCache>> {
    (0..num_layers)
        .map(|_| Box::new(SimpleKvCache::new(step)) as Box<dyn KvCache>)
        .collect()
}
