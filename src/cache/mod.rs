//! Key-Value cache for autoregressive inference.
//!
//! Stores the key and value projections of every position processed so far in
//! the current sequence, one buffer pair per layer.
//!
//! # Memory Layout
//!
//! Keys:   `[max_seq_len, n_kv_heads, head_dim]` per layer
//! Values: `[max_seq_len, n_kv_heads, head_dim]` per layer
//!
//! Buffers are allocated lazily on first use and kept across [`KvCache::reset`];
//! only [`KvCache::release`] frees them. Positions become visible through
//! [`KvCache::commit`] once every layer has written them, so a forward pass that
//! fails half-way leaves the cache at its previous length.

use crate::error::{Qwen2Error, Result};
use crate::model::ModelMeta;

/// Key and value buffers for one layer.
#[derive(Debug, Clone, Default)]
struct LayerKvCache {
    keys: Vec<f32>,
    values: Vec<f32>,
}

/// Per-layer KV cache with a shared sequence length.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,

    /// Number of committed positions.
    len: usize,

    num_layers: usize,
    max_seq_len: usize,
    n_kv_heads: usize,
    head_dim: usize,
}

impl KvCache {
    /// Describe a cache. No memory is allocated until [`ensure_allocated`](Self::ensure_allocated).
    pub fn new(num_layers: usize, max_seq_len: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        KvCache {
            layers: Vec::new(),
            len: 0,
            num_layers,
            max_seq_len,
            n_kv_heads,
            head_dim,
        }
    }

    /// A cache sized for `meta`'s full context window.
    pub fn for_model(meta: &ModelMeta) -> Self {
        Self::new(
            meta.num_layers,
            meta.max_seq_len,
            meta.num_kv_heads,
            meta.head_dim,
        )
    }

    /// Allocate zeroed buffers if they are not allocated yet.
    pub fn ensure_allocated(&mut self) {
        if self.is_allocated() {
            return;
        }
        let buf_len = self.max_seq_len * self.row_width();
        self.layers = (0..self.num_layers)
            .map(|_| LayerKvCache {
                keys: vec![0.0; buf_len],
                values: vec![0.0; buf_len],
            })
            .collect();
        self.len = 0;
    }

    pub fn is_allocated(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Free the buffers and forget every position.
    pub fn release(&mut self) {
        self.layers = Vec::new();
        self.len = 0;
    }

    /// Forget every position, keeping the allocation.
    pub fn reset(&mut self) {
        self.len = 0;
    }

    /// Number of committed positions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of positions.
    pub fn capacity(&self) -> usize {
        self.max_seq_len
    }

    pub fn remaining(&self) -> usize {
        self.max_seq_len - self.len
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Elements per position: `n_kv_heads * head_dim`.
    pub fn row_width(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }

    /// Write key/value rows for the positions right after the committed ones.
    ///
    /// `keys` and `values` hold `n` rows of [`row_width`](Self::row_width) elements.
    /// The rows stay invisible until [`commit`](Self::commit).
    pub fn write(&mut self, layer: usize, keys: &[f32], values: &[f32]) -> Result<()> {
        let width = self.row_width();
        if keys.len() != values.len() || width == 0 || keys.len() % width != 0 {
            return Err(Qwen2Error::Cache(format!(
                "rows of {} keys / {} values do not fit width {width}",
                keys.len(),
                values.len()
            )));
        }
        let n = keys.len() / width;
        self.check_room(n)?;

        let len = self.len;
        let cache = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| Qwen2Error::Cache(format!("layer {layer} not allocated")))?;
        let start = len * width;
        cache.keys[start..start + keys.len()].copy_from_slice(keys);
        cache.values[start..start + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Make `n` freshly written positions visible.
    pub fn commit(&mut self, n: usize) -> Result<()> {
        self.check_room(n)?;
        self.len += n;
        Ok(())
    }

    /// Keys of positions `[0, upto)` for `layer`, including uncommitted rows.
    pub fn keys(&self, layer: usize, upto: usize) -> Result<&[f32]> {
        let cache = self.layer(layer, upto)?;
        Ok(&cache.keys[..upto * self.row_width()])
    }

    /// Values of positions `[0, upto)` for `layer`, including uncommitted rows.
    pub fn values(&self, layer: usize, upto: usize) -> Result<&[f32]> {
        let cache = self.layer(layer, upto)?;
        Ok(&cache.values[..upto * self.row_width()])
    }

    /// Bytes held by the allocated buffers.
    pub fn memory_bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| (l.keys.len() + l.values.len()) * std::mem::size_of::<f32>())
            .sum()
    }

    fn layer(&self, layer: usize, upto: usize) -> Result<&LayerKvCache> {
        if upto > self.max_seq_len {
            return Err(Qwen2Error::Cache(format!(
                "read of {upto} positions exceeds capacity {}",
                self.max_seq_len
            )));
        }
        self.layers
            .get(layer)
            .ok_or_else(|| Qwen2Error::Cache(format!("layer {layer} not allocated")))
    }

    fn check_room(&self, n: usize) -> Result<()> {
        if self.len + n > self.max_seq_len {
            return Err(Qwen2Error::Cache(format!(
                "KV cache capacity exceeded: {} > {}",
                self.len + n,
                self.max_seq_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> KvCache {
        let mut cache = KvCache::new(2, 4, 1, 2);
        cache.ensure_allocated();
        cache
    }

    #[test]
    fn lazily_allocates() {
        let mut cache = KvCache::new(2, 4, 1, 2);
        assert!(!cache.is_allocated());
        assert_eq!(cache.memory_bytes(), 0);
        cache.ensure_allocated();
        assert_eq!(cache.memory_bytes(), 2 * 2 * 4 * 2 * 4);
    }

    #[test]
    fn rows_become_visible_on_commit() {
        let mut cache = cache();
        cache.write(0, &[1.0, 2.0], &[3.0, 4.0]).unwrap();
        cache.write(1, &[5.0, 6.0], &[7.0, 8.0]).unwrap();
        assert_eq!(cache.len(), 0);
        cache.commit(1).unwrap();
        assert_eq!(cache.len(), 1);

        cache.write(0, &[9.0, 10.0], &[11.0, 12.0]).unwrap();
        assert_eq!(cache.keys(0, 2).unwrap(), &[1.0, 2.0, 9.0, 10.0]);
        assert_eq!(cache.values(1, 1).unwrap(), &[7.0, 8.0]);
    }

    #[test]
    fn reset_keeps_allocation() {
        let mut cache = cache();
        cache.write(0, &[1.0, 2.0], &[3.0, 4.0]).unwrap();
        cache.commit(1).unwrap();
        let bytes = cache.memory_bytes();
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_bytes(), bytes);
    }

    #[test]
    fn release_frees_buffers() {
        let mut cache = cache();
        cache.commit(2).unwrap();
        cache.release();
        assert!(!cache.is_allocated());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut cache = cache();
        let rows = vec![0.0; 3 * 2];
        cache.write(0, &rows, &rows).unwrap();
        cache.commit(3).unwrap();
        assert_eq!(cache.remaining(), 1);
        assert!(cache.write(0, &rows[..4], &rows[..4]).is_err());
        assert!(cache.commit(2).is_err());
    }

    #[test]
    fn rejects_ragged_rows() {
        let mut cache = cache();
        assert!(cache.write(0, &[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).is_err());
        assert!(cache.write(0, &[1.0, 2.0], &[1.0]).is_err());
    }
}
