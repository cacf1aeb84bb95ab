//! # genlm-kv
//!
//! Per-session key/value cache for genlm.
//!
//! A position is written one layer at a time with
//! [`SessionKVCache::append_layer`] and becomes visible to the session only
//! after [`SessionKVCache::commit`]. A step that fails half way is dropped by
//! [`SessionKVCache::rollback`]; [`SessionKVCache::truncate`] rewinds to an
//! earlier committed length. Buffers are sized once, up front, and every
//! allocation is fallible so a session over the memory limit is an error
//! rather than an abort.

use std::fmt;

const F32: usize = std::mem::size_of::<f32>();

/// Committed positions by heads by head dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub positions: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(positions: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            positions,
            n_heads,
            head_dim,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.positions * self.n_heads * self.head_dim
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.positions, self.n_heads, self.head_dim)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache full: position {seq_len} exceeds capacity {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("KV width mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("no KV layer {layer} (cache has {n_layers})")]
    NoSuchLayer { layer: usize, n_layers: usize },

    #[error("layer {layer} holds {got} positions, expected {expected}")]
    OutOfStep {
        layer: usize,
        expected: usize,
        got: usize,
    },

    #[error("cannot commit: layer {layer} was not written")]
    IncompleteStep { layer: usize },

    #[error("cannot allocate {bytes} bytes of KV state")]
    AllocationFailed { bytes: usize },

    #[error("KV cache needs at least one layer")]
    NoLayers,
}

pub type KVResult<T> = Result<T, KVError>;

fn alloc_zeroed(len: usize) -> KVResult<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| KVError::AllocationFailed {
            bytes: len.saturating_mul(F32),
        })?;
    buf.resize(len, 0.0);
    Ok(buf)
}

/// Keys and values of one layer.
///
/// Both live in one buffer: keys in the first half, values in the second,
/// each laid out `[capacity, n_heads, head_dim]`.
#[derive(Debug)]
pub struct LayerCache {
    data: Vec<f32>,
    width: usize,
    capacity: usize,
    len: usize,
}

impl LayerCache {
    fn try_new(capacity: usize, width: usize) -> KVResult<Self> {
        let len = capacity
            .checked_mul(width)
            .and_then(|n| n.checked_mul(2))
            .ok_or(KVError::AllocationFailed { bytes: usize::MAX })?;
        Ok(Self {
            data: alloc_zeroed(len)?,
            width,
            capacity,
            len: 0,
        })
    }

    fn push(&mut self, k: &[f32], v: &[f32]) -> KVResult<()> {
        if let Some(bad) = [k, v].iter().find(|t| t.len() != self.width) {
            return Err(KVError::ShapeMismatch {
                expected: self.width,
                got: bad.len(),
            });
        }
        if self.len == self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.len + 1,
                max: self.capacity,
            });
        }

        let at = self.len * self.width;
        let values = self.capacity * self.width + at;
        self.data[at..at + self.width].copy_from_slice(k);
        self.data[values..values + self.width].copy_from_slice(v);
        self.len += 1;
        Ok(())
    }

    /// Keys for every written position, including one not yet committed.
    pub fn keys(&self) -> &[f32] {
        &self.data[..self.len * self.width]
    }

    /// Values, laid out like [`keys`](Self::keys).
    pub fn values(&self) -> &[f32] {
        let start = self.capacity * self.width;
        &self.data[start..start + self.len * self.width]
    }

    pub fn seq_len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn try_clone(&self) -> KVResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(self.data.len())
            .map_err(|_| KVError::AllocationFailed {
                bytes: self.data.len() * F32,
            })?;
        data.extend_from_slice(&self.data);
        Ok(Self { data, ..*self })
    }
}

/// Every layer's cache for one session.
#[derive(Debug)]
pub struct SessionKVCache {
    layers: Vec<LayerCache>,
    n_heads: usize,
    head_dim: usize,
    committed: usize,
}

impl SessionKVCache {
    /// Allocate room for `capacity` positions in each of `n_layers` layers.
    pub fn try_new(
        n_layers: usize,
        capacity: usize,
        n_heads: usize,
        head_dim: usize,
    ) -> KVResult<Self> {
        if n_layers == 0 {
            return Err(KVError::NoLayers);
        }
        let width = n_heads
            .checked_mul(head_dim)
            .ok_or(KVError::AllocationFailed { bytes: usize::MAX })?;
        let layers = (0..n_layers)
            .map(|_| LayerCache::try_new(capacity, width))
            .collect::<KVResult<Vec<_>>>()?;
        Ok(Self {
            layers,
            n_heads,
            head_dim,
            committed: 0,
        })
    }

    pub fn layer(&self, idx: usize) -> Option<&LayerCache> {
        self.layers.get(idx)
    }

    /// Committed positions.
    pub fn seq_len(&self) -> usize {
        self.committed
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn capacity(&self) -> usize {
        self.layers[0].capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.committed
    }

    pub fn shape(&self) -> KVShape {
        KVShape::new(self.committed, self.n_heads, self.head_dim)
    }

    /// Write the in-progress position for layer `idx`. Each layer is written
    /// once per step.
    pub fn append_layer(&mut self, idx: usize, k: &[f32], v: &[f32]) -> KVResult<()> {
        let n_layers = self.layers.len();
        let committed = self.committed;
        let layer = self.layers.get_mut(idx).ok_or(KVError::NoSuchLayer {
            layer: idx,
            n_layers,
        })?;
        if layer.len != committed {
            return Err(KVError::OutOfStep {
                layer: idx,
                expected: committed,
                got: layer.len,
            });
        }
        layer.push(k, v)
    }

    /// Commit the in-progress position. Changes nothing if a layer is missing.
    pub fn commit(&mut self) -> KVResult<()> {
        let next = self.committed + 1;
        if let Some(layer) = self.layers.iter().position(|l| l.len != next) {
            return Err(KVError::IncompleteStep { layer });
        }
        self.committed = next;
        Ok(())
    }

    /// Drop a partially written position.
    pub fn rollback(&mut self) {
        for layer in &mut self.layers {
            layer.len = self.committed;
        }
    }

    /// Rewind to `len` committed positions. Longer lengths are a no-op.
    pub fn truncate(&mut self, len: usize) {
        self.committed = self.committed.min(len);
        self.rollback();
    }

    /// Deep copy sharing nothing with `self`.
    pub fn try_clone(&self) -> KVResult<Self> {
        let layers = self
            .layers
            .iter()
            .map(LayerCache::try_clone)
            .collect::<KVResult<Vec<_>>>()?;
        Ok(Self {
            layers,
            n_heads: self.n_heads,
            head_dim: self.head_dim,
            committed: self.committed,
        })
    }

    /// Bytes allocated across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.data.len() * F32).sum()
    }

    /// Bytes holding committed positions.
    pub fn active_memory_bytes(&self) -> usize {
        self.shape().total_elements() * 2 * F32 * self.layers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(layers: usize, capacity: usize) -> SessionKVCache {
        SessionKVCache::try_new(layers, capacity, 2, 4).unwrap()
    }

    fn step(cache: &mut SessionKVCache, value: f32) {
        for layer in 0..cache.n_layers() {
            cache.append_layer(layer, &[value; 8], &[-value; 8]).unwrap();
        }
        cache.commit().unwrap();
    }

    #[test]
    fn shape_reports_committed_positions() {
        let shape = KVShape::new(128, 8, 64);
        assert_eq!(shape.total_elements(), 128 * 8 * 64);
        assert_eq!(shape.to_string(), "128x8x64");
    }

    #[test]
    fn keys_and_values_are_kept_apart() {
        let mut cache = cache(1, 4);
        step(&mut cache, 1.0);
        step(&mut cache, 2.0);
        let layer = cache.layer(0).unwrap();
        assert_eq!(&layer.keys()[8..], &[2.0; 8]);
        assert_eq!(&layer.values()[..8], &[-1.0; 8]);
    }

    #[test]
    fn wrong_width_is_rejected() {
        let mut cache = cache(1, 4);
        assert_eq!(
            cache.append_layer(0, &[0.0; 8], &[0.0; 7]),
            Err(KVError::ShapeMismatch {
                expected: 8,
                got: 7
            })
        );
        assert_eq!(
            cache.append_layer(3, &[0.0; 8], &[0.0; 8]),
            Err(KVError::NoSuchLayer {
                layer: 3,
                n_layers: 1
            })
        );
    }

    #[test]
    fn commit_advances_every_layer() {
        let mut cache = cache(3, 10);
        step(&mut cache, 1.0);
        assert_eq!(cache.seq_len(), 1);
        assert!((0..3).all(|i| cache.layer(i).unwrap().seq_len() == 1));
    }

    #[test]
    fn incomplete_step_is_not_committed() {
        let mut cache = cache(2, 10);
        cache.append_layer(0, &[0.1; 8], &[0.1; 8]).unwrap();
        assert_eq!(cache.commit(), Err(KVError::IncompleteStep { layer: 1 }));
        assert_eq!(cache.seq_len(), 0);

        cache.rollback();
        assert_eq!(cache.layer(0).unwrap().seq_len(), 0);
    }

    #[test]
    fn layer_written_twice_is_out_of_step() {
        let mut cache = cache(2, 10);
        cache.append_layer(0, &[0.1; 8], &[0.1; 8]).unwrap();
        assert_eq!(
            cache.append_layer(0, &[0.1; 8], &[0.1; 8]),
            Err(KVError::OutOfStep {
                layer: 0,
                expected: 0,
                got: 1
            })
        );
    }

    #[test]
    fn truncate_only_shortens() {
        let mut cache = cache(2, 10);
        for i in 0..5 {
            step(&mut cache, i as f32);
        }
        cache.truncate(2);
        assert_eq!(cache.seq_len(), 2);
        assert_eq!(cache.layer(1).unwrap().seq_len(), 2);

        cache.truncate(4);
        assert_eq!(cache.seq_len(), 2);
    }

    #[test]
    fn clones_are_independent() {
        let mut cache = cache(2, 10);
        step(&mut cache, 1.0);

        let mut copy = cache.try_clone().unwrap();
        step(&mut copy, 2.0);

        assert_eq!(cache.seq_len(), 1);
        assert_eq!(copy.seq_len(), 2);
        assert_eq!(cache.layer(0).unwrap().keys(), &[1.0; 8]);
    }

    #[test]
    fn zero_layers_is_an_error() {
        assert_eq!(SessionKVCache::try_new(0, 10, 2, 4).unwrap_err(), KVError::NoLayers);
    }

    #[test]
    fn impossible_allocation_is_reported() {
        let err = SessionKVCache::try_new(1, usize::MAX / 64, 2, 4).unwrap_err();
        assert!(matches!(err, KVError::AllocationFailed { .. }));

        let err = SessionKVCache::try_new(1, usize::MAX, 2, 4).unwrap_err();
        assert!(matches!(err, KVError::AllocationFailed { .. }));
        let err = SessionKVCache::try_new(1, 4, usize::MAX, 2).unwrap_err();
        assert!(matches!(err, KVError::AllocationFailed { .. }));
    }
}
