use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Fixed-size contiguous memory region owned by the pool.
///
/// The byte plane sits behind its own reader/writer lock so pinned buffers
/// can move data while the pool mutates segment structure elsewhere.
#[derive(Clone)]
pub struct Slab {
    bytes: Arc<RwLock<Box<[u8]>>>,
    len: usize,
}

impl Slab {
    pub fn new(bytes: Box<[u8]>) -> Self {
        let len = bytes.len();
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn storage(&self) -> Arc<RwLock<Box<[u8]>>> {
        Arc::clone(&self.bytes)
    }
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab").field("len", &self.len).finish()
    }
}

/// Raw memory acquisition hook, implemented per memory tier.
///
/// The pool calls `alloc_slab` while holding its structural lock, so
/// implementations must not call back into the pool.
pub trait SlabMemory: Send + Sync {
    fn alloc_slab(&self, num_bytes: usize) -> Result<Slab>;
}

/// Host-RAM tier: slabs are zeroed heap allocations.
#[derive(Debug, Default)]
pub struct HostSlabMemory;

impl SlabMemory for HostSlabMemory {
    fn alloc_slab(&self, num_bytes: usize) -> Result<Slab> {
        Ok(Slab::new(vec![0u8; num_bytes].into_boxed_slice()))
    }
}
