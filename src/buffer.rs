//! Chunk buffers: the byte-moving objects handed to consumers.
//!
//! A [`Buffer`] is a view over a page run inside one slab (or over a private
//! heap region for standalone buffers). The pool rebinds that view when the
//! chunk migrates during growth and severs it on eviction or delete, after
//! which data access fails with [`PoolError::NotResident`] instead of
//! touching reused pages.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{PoolError, Result};
use crate::key::ChunkKey;
use crate::pool::BufferPool;

/// Per-chunk metadata carried alongside the raw bytes and mirrored between
/// tiers on fetch and put.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferMeta {
    pub element_count: u64,
}

/// Where a buffer's bytes currently live.
#[derive(Clone)]
pub(crate) struct MemBinding {
    pub storage: Arc<RwLock<Box<[u8]>>>,
    pub offset: usize,
    pub capacity: usize,
}

struct BufferState {
    mem: Option<MemBinding>,
    size: usize,
    dirty: bool,
    updated: bool,
    appended: bool,
    meta: BufferMeta,
    key: Option<ChunkKey>,
}

/// Pinned-access byte container backed by pool pages.
///
/// Dirty tracking distinguishes in-place overwrites (`updated`) from pure
/// tail growth (`appended`), which lets a parent tier materialize appended
/// chunks incrementally.
pub struct Buffer {
    page_size: usize,
    device_id: i32,
    pin_count: AtomicU32,
    pool: Weak<BufferPool>,
    state: Mutex<BufferState>,
}

impl Buffer {
    /// Buffer owned by a pool chunk. Born pinned: the caller that creates it
    /// holds the initial pin until it wraps the buffer in a handle.
    pub(crate) fn new_in_pool(
        pool: Weak<BufferPool>,
        page_size: usize,
        device_id: i32,
        key: Option<ChunkKey>,
    ) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            device_id,
            pin_count: AtomicU32::new(1),
            pool,
            state: Mutex::new(BufferState {
                mem: None,
                size: 0,
                dirty: false,
                updated: false,
                appended: false,
                meta: BufferMeta::default(),
                key,
            }),
        })
    }

    /// Free-standing buffer over private heap memory; used as a copy
    /// destination when fetching across tiers.
    pub fn standalone(page_size: usize, device_id: i32) -> Arc<Self> {
        Arc::new(Self {
            page_size: page_size.max(1),
            device_id,
            pin_count: AtomicU32::new(0),
            pool: Weak::new(),
            state: Mutex::new(BufferState {
                mem: None,
                size: 0,
                dirty: false,
                updated: false,
                appended: false,
                meta: BufferMeta::default(),
                key: None,
            }),
        })
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin without matching pin");
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Reserved bytes; zero until the chunk is placed in a slab.
    pub fn capacity(&self) -> usize {
        self.state.lock().mem.as_ref().map_or(0, |m| m.capacity)
    }

    pub fn is_resident(&self) -> bool {
        self.state.lock().mem.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_updated(&self) -> bool {
        self.state.lock().updated
    }

    pub fn is_appended(&self) -> bool {
        self.state.lock().appended
    }

    pub fn clear_dirty_bits(&self) {
        let mut st = self.state.lock();
        st.dirty = false;
        st.updated = false;
        st.appended = false;
    }

    pub fn meta(&self) -> BufferMeta {
        self.state.lock().meta
    }

    pub fn set_meta(&self, meta: BufferMeta) {
        self.state.lock().meta = meta;
    }

    /// Copies the other buffer's metadata onto this one.
    pub fn sync_meta(&self, other: &Buffer) {
        let meta = other.meta();
        self.state.lock().meta = meta;
    }

    /// Key of the owning chunk, if any. This is the back-reference that lets
    /// the pool resolve a buffer back to its catalog entry.
    pub fn chunk_key(&self) -> Option<ChunkKey> {
        self.state.lock().key.clone()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Reads `num_bytes` starting at `offset` into `dst`.
    pub fn read(&self, dst: &mut [u8], num_bytes: usize, offset: usize) -> Result<()> {
        if num_bytes == 0 {
            return Ok(());
        }
        if dst.len() < num_bytes {
            return Err(PoolError::Invalid(format!(
                "destination slice holds {} bytes, read wants {num_bytes}",
                dst.len()
            )));
        }
        let st = self.state.lock();
        if offset + num_bytes > st.size {
            return Err(PoolError::Invalid(format!(
                "read of {num_bytes} bytes at offset {offset} past end of buffer (size {})",
                st.size
            )));
        }
        let mem = st.mem.as_ref().ok_or(PoolError::NotResident)?;
        let guard = mem.storage.read();
        let start = mem.offset + offset;
        dst[..num_bytes].copy_from_slice(&guard[start..start + num_bytes]);
        Ok(())
    }

    /// Writes `src` at `offset`, growing the reservation through the pool
    /// when needed. Marks the buffer dirty; overwrites below the current
    /// size additionally mark it updated, growth marks it appended.
    pub fn write(&self, src: &[u8], offset: usize) -> Result<()> {
        if src.is_empty() {
            return Err(PoolError::Invalid("write of zero bytes".into()));
        }
        self.reserve(offset + src.len())?;
        let mut st = self.state.lock();
        let mem = st.mem.as_ref().ok_or(PoolError::NotResident)?;
        if offset + src.len() > mem.capacity {
            return Err(PoolError::Invalid(
                "buffer capacity changed during write".into(),
            ));
        }
        {
            let mut guard = mem.storage.write();
            let start = mem.offset + offset;
            guard[start..start + src.len()].copy_from_slice(src);
        }
        st.dirty = true;
        if offset < st.size {
            st.updated = true;
        }
        if offset + src.len() > st.size {
            st.appended = true;
            st.size = offset + src.len();
        }
        Ok(())
    }

    /// Appends `src` after the current contents.
    pub fn append(&self, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Err(PoolError::Invalid("append of zero bytes".into()));
        }
        let size = self.size();
        self.reserve(size + src.len())?;
        let mut st = self.state.lock();
        let mem = st.mem.as_ref().ok_or(PoolError::NotResident)?;
        if st.size + src.len() > mem.capacity {
            return Err(PoolError::Invalid(
                "buffer capacity changed during append".into(),
            ));
        }
        {
            let mut guard = mem.storage.write();
            let start = mem.offset + st.size;
            guard[start..start + src.len()].copy_from_slice(src);
        }
        st.dirty = true;
        st.appended = true;
        st.size += src.len();
        Ok(())
    }

    /// Ensures at least `num_bytes` of reservation; never shrinks.
    ///
    /// Pool-owned buffers grow through the pool, which may migrate the chunk
    /// to a different page run; callers must hold a pin so concurrent
    /// eviction cannot select the chunk mid-growth. Standalone buffers grow
    /// their private region in place.
    pub fn reserve(&self, num_bytes: usize) -> Result<()> {
        if num_bytes <= self.capacity() {
            return Ok(());
        }
        match self.pool.upgrade() {
            Some(pool) => {
                let key = self
                    .chunk_key()
                    .ok_or_else(|| PoolError::Invalid("buffer has no owning chunk".into()))?;
                pool.reserve_bytes(&key, num_bytes)
            }
            None => self.grow_standalone(num_bytes),
        }
    }

    /// Sets the logical size without touching contents. The reservation must
    /// already cover `num_bytes`.
    pub fn set_size(&self, num_bytes: usize) -> Result<()> {
        let mut st = self.state.lock();
        let capacity = st.mem.as_ref().map_or(0, |m| m.capacity);
        if num_bytes > capacity {
            return Err(PoolError::Invalid(format!(
                "size {num_bytes} exceeds reservation of {capacity} bytes"
            )));
        }
        st.size = num_bytes;
        Ok(())
    }

    fn grow_standalone(&self, num_bytes: usize) -> Result<()> {
        let mut st = self.state.lock();
        let current = st.mem.as_ref().map_or(0, |m| m.capacity);
        if num_bytes <= current {
            return Ok(());
        }
        let capacity = num_bytes.div_ceil(self.page_size) * self.page_size;
        let mut bytes = vec![0u8; capacity];
        if let Some(old) = &st.mem {
            let guard = old.storage.read();
            bytes[..st.size].copy_from_slice(&guard[old.offset..old.offset + st.size]);
        }
        st.mem = Some(MemBinding {
            storage: Arc::new(RwLock::new(bytes.into_boxed_slice())),
            offset: 0,
            capacity,
        });
        Ok(())
    }

    /// Raw copy into the reservation: no dirty bits, no size change. Used
    /// when materializing clean data from another tier.
    pub(crate) fn write_raw(&self, src: &[u8], offset: usize) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let st = self.state.lock();
        let mem = st.mem.as_ref().ok_or(PoolError::NotResident)?;
        if offset + src.len() > mem.capacity {
            return Err(PoolError::Invalid(format!(
                "raw write of {} bytes at offset {offset} exceeds reservation of {} bytes",
                src.len(),
                mem.capacity
            )));
        }
        let mut guard = mem.storage.write();
        let start = mem.offset + offset;
        guard[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Points the buffer at a new page run, returning the old binding so the
    /// caller can copy surviving contents across.
    pub(crate) fn rebind(&self, binding: MemBinding) -> Option<MemBinding> {
        self.state.lock().mem.replace(binding)
    }

    /// Widens the reservation in place after the owning segment absorbed a
    /// free neighbour.
    pub(crate) fn extend_capacity(&self, capacity: usize) {
        if let Some(mem) = self.state.lock().mem.as_mut() {
            if capacity > mem.capacity {
                mem.capacity = capacity;
            }
        }
    }

    /// Severs the memory binding; subsequent data access fails with
    /// [`PoolError::NotResident`].
    pub(crate) fn unbind(&self) {
        self.state.lock().mem = None;
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Buffer")
            .field("key", &st.key)
            .field("size", &st.size)
            .field("capacity", &st.mem.as_ref().map_or(0, |m| m.capacity))
            .field("resident", &st.mem.is_some())
            .field("dirty", &st.dirty)
            .field("pin_count", &self.pin_count.load(Ordering::SeqCst))
            .finish()
    }
}

/// Pinned access to a buffer. Dropping the handle releases the pin, which
/// re-exposes the chunk to eviction.
pub struct BufferHandle {
    buffer: Arc<Buffer>,
}

impl BufferHandle {
    /// Wraps a buffer whose pin the caller already holds.
    pub(crate) fn adopt(buffer: Arc<Buffer>) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl std::ops::Deref for BufferHandle {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.buffer.unpin();
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.buffer.fmt(f)
    }
}
