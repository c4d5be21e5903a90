use crate::error::{PoolError, Result};

/// Geometry and placement parameters for a [`BufferPool`](crate::BufferPool).
///
/// The pool carves `max_buffer_size` bytes of arena into slabs of
/// `slab_size` bytes, and each slab into pages of `page_size` bytes. Pages
/// are the allocation quantum; a single chunk never spans slabs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Allocation quantum in bytes.
    pub page_size: usize,
    /// Bytes per slab; must be a multiple of `page_size`.
    pub slab_size: usize,
    /// Upper bound on total arena bytes; must be at least one slab.
    pub max_buffer_size: usize,
    /// Identifier of the memory tier this pool fronts.
    pub device_id: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            slab_size: 4 * 1024 * 1024,
            max_buffer_size: 64 * 1024 * 1024,
            device_id: 0,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.slab_size == 0 || self.max_buffer_size == 0 {
            return Err(PoolError::Invalid(
                "page_size, slab_size and max_buffer_size must be positive".into(),
            ));
        }
        if self.slab_size % self.page_size != 0 {
            return Err(PoolError::Invalid(format!(
                "slab_size {} is not a multiple of page_size {}",
                self.slab_size, self.page_size
            )));
        }
        if self.max_buffer_size < self.slab_size {
            return Err(PoolError::Invalid(format!(
                "max_buffer_size {} is smaller than slab_size {}",
                self.max_buffer_size, self.slab_size
            )));
        }
        Ok(())
    }

    pub fn num_pages_per_slab(&self) -> usize {
        self.slab_size / self.page_size
    }

    /// Slab count ceiling; the pool appends slabs lazily up to this.
    pub fn max_num_slabs(&self) -> usize {
        self.max_buffer_size / self.slab_size
    }
}
