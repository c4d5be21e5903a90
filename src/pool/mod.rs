//! The buffer pool facade.
//!
//! A [`BufferPool`] mediates between consumers that need pinned chunk memory
//! and a slower parent tier. Chunks live in fixed-size slabs carved into
//! pages; the pool tracks them as linked segments, serves lookups through an
//! ordered chunk index, and evicts cold unpinned chunks when the arena is
//! exhausted.
//!
//! Three mutexes guard the shared state, always acquired in the same order:
//! the structural lock (`sized`) before the chunk index, with the unsized
//! placeholder list as a leaf lock below either. Parent-tier fetches happen
//! outside all pool locks, relying on the pin count to keep the in-flight
//! chunk resident.

mod alloc;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::{Buffer, BufferHandle, BufferMeta};
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::key::ChunkKey;
use crate::parent::ParentStore;
use crate::segment::{SegHandle, SegStatus, Segment, SegmentList};
use crate::slab::{HostSlabMemory, Slab, SlabMemory};

/// Stable reference to a segment: which list it lives in, and where.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegRef {
    /// Owning slab, or `None` for placeholders in the unsized list.
    pub slab: Option<usize>,
    pub handle: SegHandle,
}

/// Structural state: slabs, their segment runs, and counters. Everything
/// here is guarded by the pool's `sized` mutex.
pub(crate) struct SizedState {
    pub slabs: Vec<Slab>,
    pub slab_segments: Vec<SegmentList>,
    pub stats: PoolStats,
}

/// Operation counters, snapshotted by [`BufferPool::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub evicted_pages: u64,
    pub slabs_allocated: u64,
    pub dirty_writebacks: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={} evicted_pages={} slabs={} writebacks={}",
            self.hits,
            self.misses,
            self.evictions,
            self.evicted_pages,
            self.slabs_allocated,
            self.dirty_writebacks
        )
    }
}

/// Public shape of one segment, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub start_page: usize,
    pub num_pages: usize,
    pub is_free: bool,
    pub chunk_key: Option<ChunkKey>,
}

/// Caching allocator over a fixed-capacity paged arena.
pub struct BufferPool {
    config: PoolConfig,
    memory: Box<dyn SlabMemory>,
    parent: Option<Arc<dyn ParentStore>>,
    weak_self: Weak<BufferPool>,
    pub(crate) sized: Mutex<SizedState>,
    pub(crate) chunk_index: Mutex<BTreeMap<ChunkKey, SegRef>>,
    pub(crate) unsized_segs: Mutex<SegmentList>,
    next_buffer_id: Mutex<i32>,
    buffer_epoch: AtomicU64,
}

impl BufferPool {
    /// Builds a pool over the given memory tier. `parent` is the next,
    /// slower tier; the top of a hierarchy passes `None`.
    pub fn new(
        config: PoolConfig,
        memory: Box<dyn SlabMemory>,
        parent: Option<Arc<dyn ParentStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            page_size = config.page_size,
            slab_size = config.slab_size,
            max_buffer_size = config.max_buffer_size,
            device = config.device_id,
            "initializing buffer pool"
        );
        Ok(Arc::new_cyclic(|weak| Self {
            config,
            memory,
            parent,
            weak_self: weak.clone(),
            sized: Mutex::new(SizedState {
                slabs: Vec::new(),
                slab_segments: Vec::new(),
                stats: PoolStats::default(),
            }),
            chunk_index: Mutex::new(BTreeMap::new()),
            unsized_segs: Mutex::new(SegmentList::new()),
            next_buffer_id: Mutex::new(0),
            buffer_epoch: AtomicU64::new(0),
        }))
    }

    /// Pool backed by host RAM.
    pub fn host(config: PoolConfig, parent: Option<Arc<dyn ParentStore>>) -> Result<Arc<Self>> {
        Self::new(config, Box::new(HostSlabMemory), parent)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Creates a chunk and returns its buffer, pinned.
    ///
    /// The chunk starts life as a placeholder in the unsized list, where the
    /// evictor cannot see it; allocating `initial_size` bytes then places it
    /// in a slab (possibly evicting others to make room). `chunk_page_size`
    /// of zero means the pool's page size.
    pub fn create(
        &self,
        key: &ChunkKey,
        chunk_page_size: usize,
        initial_size: usize,
    ) -> Result<BufferHandle> {
        let page_size = if chunk_page_size == 0 {
            self.config.page_size
        } else {
            chunk_page_size
        };
        let placeholder = {
            let mut index = self.chunk_index.lock();
            if index.contains_key(key) {
                return Err(PoolError::AlreadyExists);
            }
            let mut unsized_segs = self.unsized_segs.lock();
            let mut seg = Segment::placeholder();
            seg.chunk_key = Some(key.clone());
            let handle = unsized_segs.push_back(seg);
            index.insert(
                key.clone(),
                SegRef {
                    slab: None,
                    handle,
                },
            );
            handle
        };
        // The buffer is born pinned, so once placed it cannot be evicted
        // before this handle reaches the caller.
        let buffer = Buffer::new_in_pool(
            self.weak_self.clone(),
            page_size,
            self.config.device_id,
            Some(key.clone()),
        );
        {
            let mut unsized_segs = self.unsized_segs.lock();
            if let Some(seg) = unsized_segs.get_mut(placeholder) {
                seg.buffer = Some(buffer.clone());
            }
        }
        let handle = BufferHandle::adopt(buffer);
        if initial_size > 0 {
            if let Err(err) = self.reserve_bytes(key, initial_size) {
                drop(handle);
                let _ = self.delete(key);
                return Err(err);
            }
        }
        Ok(handle)
    }

    /// Returns the chunk's buffer, pinned, refreshing its LRU stamp. A miss
    /// creates the chunk and fills it from the parent tier; if the parent
    /// cannot supply it the fresh chunk is torn down again.
    pub fn get(&self, key: &ChunkKey, num_bytes: usize) -> Result<BufferHandle> {
        let found = {
            let mut state = self.sized.lock();
            let seg_ref = {
                let index = self.chunk_index.lock();
                index.get(key).copied()
            };
            match seg_ref {
                Some(seg_ref) => {
                    state.stats.hits += 1;
                    let epoch = self.next_epoch();
                    let buffer = self
                        .with_segment_mut(&mut state, seg_ref, |seg| {
                            seg.last_touched = epoch;
                            seg.buffer.clone()
                        })
                        .flatten()
                        .ok_or(PoolError::NotFound)?;
                    buffer.pin();
                    Some(buffer)
                }
                None => {
                    state.stats.misses += 1;
                    None
                }
            }
        };
        match found {
            Some(buffer) => {
                let handle = BufferHandle::adopt(buffer);
                if handle.size() < num_bytes {
                    if let Some(parent) = &self.parent {
                        parent.fetch(key, handle.buffer(), num_bytes)?;
                    }
                }
                Ok(handle)
            }
            None => {
                let parent = self.parent.as_ref().ok_or(PoolError::NotFound)?;
                let handle = self.create(key, self.config.page_size, num_bytes)?;
                if let Err(err) = parent.fetch(key, handle.buffer(), num_bytes) {
                    debug!(%key, error = %err, "parent fetch failed; dropping fresh chunk");
                    drop(handle);
                    let _ = self.delete(key);
                    return Err(PoolError::NotFound);
                }
                Ok(handle)
            }
        }
    }

    /// Copies the chunk into a caller-provided buffer. A chunk marked
    /// updated is copied from the start; otherwise only the tail beyond the
    /// destination's current size is copied, which lets append-only chunks
    /// materialize incrementally.
    pub fn fetch(&self, key: &ChunkKey, dest: &Buffer, num_bytes: usize) -> Result<()> {
        let found = {
            let mut state = self.sized.lock();
            let seg_ref = {
                let index = self.chunk_index.lock();
                index.get(key).copied()
            };
            match seg_ref {
                Some(seg_ref) => {
                    let buffer = self
                        .with_segment_mut(&mut state, seg_ref, |seg| seg.buffer.clone())
                        .flatten()
                        .ok_or(PoolError::NotFound)?;
                    buffer.pin();
                    Some(BufferHandle::adopt(buffer))
                }
                None => None,
            }
        };
        let source = match found {
            Some(handle) => handle,
            None => {
                let parent = self.parent.as_ref().ok_or(PoolError::NotFound)?;
                let handle = self.create(key, self.config.page_size, num_bytes)?;
                if let Err(err) = parent.fetch(key, handle.buffer(), num_bytes) {
                    debug!(%key, error = %err, "parent fetch failed; dropping fresh chunk");
                    drop(handle);
                    let _ = self.delete(key);
                    return Err(PoolError::NotFound);
                }
                handle
            }
        };
        let chunk_size = if num_bytes == 0 { source.size() } else { num_bytes };
        dest.reserve(chunk_size)?;
        if source.is_updated() {
            let len = chunk_size.min(source.size());
            copy_chunk(&source, dest, 0, 0, len)?;
        } else {
            let dest_size = dest.size();
            if chunk_size > dest_size {
                let len = (chunk_size - dest_size).min(source.size().saturating_sub(dest_size));
                copy_chunk(&source, dest, dest_size, dest_size, len)?;
            }
        }
        dest.set_size(chunk_size)?;
        dest.sync_meta(&source);
        Ok(())
    }

    /// Writes `src` into the pool's chunk, creating it when absent. Fails
    /// with [`PoolError::Inconsistency`] if the pool copy carries unflushed
    /// writes of its own. An updated source overwrites in full; an appended
    /// source contributes only its new tail.
    pub fn put(&self, key: &ChunkKey, src: &Buffer, num_bytes: usize) -> Result<()> {
        let existing = {
            let mut state = self.sized.lock();
            let seg_ref = {
                let index = self.chunk_index.lock();
                index.get(key).copied()
            };
            match seg_ref {
                Some(seg_ref) => {
                    let buffer = self
                        .with_segment_mut(&mut state, seg_ref, |seg| seg.buffer.clone())
                        .flatten()
                        .ok_or(PoolError::NotFound)?;
                    buffer.pin();
                    Some(BufferHandle::adopt(buffer))
                }
                None => None,
            }
        };
        let target = match existing {
            Some(handle) => handle,
            None => self.create(key, self.config.page_size, 0)?,
        };
        let old_size = target.size();
        let new_size = if num_bytes == 0 { src.size() } else { num_bytes };
        if target.is_dirty() {
            return Err(PoolError::Inconsistency("chunk has unflushed writes"));
        }
        if src.is_updated() {
            let len = new_size.min(src.size());
            if len > 0 {
                let mut tmp = vec![0u8; len];
                src.read(&mut tmp, len, 0)?;
                target.write(&tmp, 0)?;
            }
        } else if src.is_appended() {
            if old_size >= new_size {
                return Err(PoolError::Inconsistency("appended chunk did not grow"));
            }
            let tail = new_size - old_size;
            let mut tmp = vec![0u8; tail];
            src.read(&mut tmp, tail, old_size)?;
            target.append(&tmp)?;
        }
        src.clear_dirty_bits();
        target.sync_meta(src);
        Ok(())
    }

    /// Removes the chunk: unbinds its buffer and frees its pages, merging
    /// with free neighbours.
    pub fn delete(&self, key: &ChunkKey) -> Result<()> {
        let seg_ref = self
            .chunk_index
            .lock()
            .remove(key)
            .ok_or(PoolError::NotFound)?;
        let mut state = self.sized.lock();
        if let Some(buffer) = self
            .with_segment_mut(&mut state, seg_ref, |seg| seg.buffer.take())
            .flatten()
        {
            buffer.unbind();
        }
        self.remove_segment(&mut state, seg_ref);
        Ok(())
    }

    /// Deletes every chunk whose key begins with `prefix`. An unmatched
    /// prefix is not an error.
    pub fn delete_prefix(&self, prefix: &ChunkKey) -> Result<()> {
        let mut state = self.sized.lock();
        let mut index = self.chunk_index.lock();
        let victims: Vec<(ChunkKey, SegRef)> = index
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, seg_ref)| (key.clone(), *seg_ref))
            .collect();
        for (key, seg_ref) in victims {
            if let Some(buffer) = self
                .with_segment_mut(&mut state, seg_ref, |seg| seg.buffer.take())
                .flatten()
            {
                buffer.unbind();
            }
            self.remove_segment(&mut state, seg_ref);
            index.remove(&key);
        }
        Ok(())
    }

    /// Pushes every dirty catalog chunk to the parent tier and clears its
    /// dirty bits. Anonymous allocations are skipped; a pool with no parent
    /// has nowhere to flush and does nothing.
    pub fn checkpoint(&self) -> Result<()> {
        let parent = match &self.parent {
            Some(parent) => parent,
            None => return Ok(()),
        };
        let mut state = self.sized.lock();
        let index = self.chunk_index.lock();
        let mut flushed = 0u64;
        for (key, seg_ref) in index.iter() {
            if key.is_anonymous() {
                continue;
            }
            let buffer = match self
                .with_segment_mut(&mut state, *seg_ref, |seg| seg.buffer.clone())
                .flatten()
            {
                Some(buffer) => buffer,
                None => continue,
            };
            if buffer.is_dirty() {
                parent.put(key, &buffer)?;
                buffer.clear_dirty_bits();
                flushed += 1;
            }
        }
        drop(index);
        state.stats.dirty_writebacks += flushed;
        if flushed > 0 {
            debug!(chunks = flushed, "checkpoint flushed dirty chunks");
        }
        Ok(())
    }

    /// Allocates an anonymous chunk, owned by no catalog entry.
    pub fn alloc(&self, num_bytes: usize) -> Result<BufferHandle> {
        let key = {
            let mut next = self.next_buffer_id.lock();
            let id = *next;
            *next += 1;
            ChunkKey::anonymous(id)
        };
        self.create(&key, self.config.page_size, num_bytes)
    }

    /// Releases a buffer obtained from [`alloc`](Self::alloc) (or any other
    /// chunk handle), deleting the chunk it belongs to.
    pub fn free(&self, handle: BufferHandle) -> Result<()> {
        let key = handle
            .chunk_key()
            .ok_or_else(|| PoolError::Invalid("buffer does not belong to a chunk".into()))?;
        drop(handle);
        self.delete(&key)
    }

    /// Drops every chunk, slab, and placeholder and rewinds the LRU epoch.
    pub fn clear(&self) {
        let mut state = self.sized.lock();
        let mut index = self.chunk_index.lock();
        let mut unsized_segs = self.unsized_segs.lock();
        let seg_refs: Vec<SegRef> = index.values().copied().collect();
        for seg_ref in seg_refs {
            let buffer = match seg_ref.slab {
                Some(slab_num) => state
                    .slab_segments
                    .get_mut(slab_num)
                    .and_then(|list| list.get_mut(seg_ref.handle))
                    .and_then(|seg| seg.buffer.take()),
                None => unsized_segs
                    .get_mut(seg_ref.handle)
                    .and_then(|seg| seg.buffer.take()),
            };
            if let Some(buffer) = buffer {
                buffer.unbind();
            }
        }
        index.clear();
        state.slabs.clear();
        state.slab_segments.clear();
        unsized_segs.clear();
        self.buffer_epoch.store(0, Ordering::SeqCst);
        debug!("cleared buffer pool");
    }

    pub fn is_resident(&self, key: &ChunkKey) -> bool {
        self.chunk_index.lock().contains_key(key)
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_index.lock().len()
    }

    /// Arena bytes currently backed by slabs.
    pub fn allocated_bytes(&self) -> usize {
        self.sized.lock().slabs.iter().map(Slab::len).sum()
    }

    pub fn max_size(&self) -> usize {
        self.config.max_buffer_size
    }

    pub fn stats(&self) -> PoolStats {
        self.sized.lock().stats
    }

    /// Chunk metadata queries belong to catalog-backed tiers; this pool
    /// cannot answer them.
    pub fn chunk_metadata(&self) -> Result<Vec<(ChunkKey, BufferMeta)>> {
        Err(PoolError::Unsupported("chunk metadata queries"))
    }

    /// See [`chunk_metadata`](Self::chunk_metadata).
    pub fn chunk_metadata_for_prefix(
        &self,
        _prefix: &ChunkKey,
    ) -> Result<Vec<(ChunkKey, BufferMeta)>> {
        Err(PoolError::Unsupported("chunk metadata queries"))
    }

    /// Per-slab segment layout, in page order.
    pub fn slab_layouts(&self) -> Vec<Vec<SegmentInfo>> {
        let state = self.sized.lock();
        state
            .slab_segments
            .iter()
            .map(|list| {
                list.iter()
                    .map(|(_, seg)| SegmentInfo {
                        start_page: seg.start_page,
                        num_pages: seg.num_pages,
                        is_free: seg.is_free(),
                        chunk_key: seg.chunk_key.clone(),
                    })
                    .collect()
            })
            .collect()
    }

    /// Human-readable report of slabs, segments, and the chunk index.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let state = self.sized.lock();
        let index = self.chunk_index.lock();
        let mut out = String::new();
        for (slab_num, list) in state.slab_segments.iter().enumerate() {
            let _ = writeln!(out, "slab {slab_num}:");
            for (_, seg) in list.iter() {
                let range = seg.start_page..seg.start_page + seg.num_pages;
                match seg.status {
                    SegStatus::Free => {
                        let _ = writeln!(out, "  pages {range:?} FREE");
                    }
                    SegStatus::Used => {
                        let _ = writeln!(
                            out,
                            "  pages {range:?} USED key={} touched={} pins={}",
                            seg.chunk_key
                                .as_ref()
                                .map_or_else(|| "<anon>".to_string(), ChunkKey::to_string),
                            seg.last_touched,
                            seg.pin_count()
                        );
                    }
                }
            }
        }
        let _ = writeln!(out, "index: {} chunks", index.len());
        for (key, seg_ref) in index.iter() {
            let _ = writeln!(out, "  {key} -> slab {:?}", seg_ref.slab);
        }
        out
    }

    /// Checks the pool's structural invariants: each slab exactly tiled by
    /// its segments, no zero-page segments, eager coalescing, and full
    /// agreement between the chunk index and the segment lists.
    pub fn verify_integrity(&self) -> Result<()> {
        let state = self.sized.lock();
        let index = self.chunk_index.lock();
        let unsized_segs = self.unsized_segs.lock();
        for (slab_num, list) in state.slab_segments.iter().enumerate() {
            let mut expected_page = 0usize;
            let mut prev_free = false;
            for (handle, seg) in list.iter() {
                if seg.num_pages == 0 {
                    return Err(PoolError::Inconsistency("zero-page segment"));
                }
                if seg.start_page != expected_page {
                    return Err(PoolError::Inconsistency("segment run has a gap or overlap"));
                }
                if seg.is_free() && prev_free {
                    return Err(PoolError::Inconsistency("adjacent free segments not coalesced"));
                }
                if seg.status == SegStatus::Used {
                    if seg.slab != Some(slab_num) {
                        return Err(PoolError::Inconsistency("segment slab back-pointer is wrong"));
                    }
                    if let Some(key) = &seg.chunk_key {
                        let seg_ref = index.get(key).ok_or(PoolError::Inconsistency(
                            "used segment missing from chunk index",
                        ))?;
                        if seg_ref.slab != Some(slab_num) || seg_ref.handle != handle {
                            return Err(PoolError::Inconsistency(
                                "chunk index points at the wrong segment",
                            ));
                        }
                    }
                }
                prev_free = seg.is_free();
                expected_page += seg.num_pages;
            }
            if expected_page != self.config.num_pages_per_slab() {
                return Err(PoolError::Inconsistency("segments do not tile the slab"));
            }
        }
        for (key, seg_ref) in index.iter() {
            let matches = match seg_ref.slab {
                Some(slab_num) => state
                    .slab_segments
                    .get(slab_num)
                    .and_then(|list| list.get(seg_ref.handle))
                    .map(|seg| {
                        seg.status == SegStatus::Used && seg.chunk_key.as_ref() == Some(key)
                    }),
                None => unsized_segs.get(seg_ref.handle).map(|seg| {
                    seg.status == SegStatus::Used && seg.chunk_key.as_ref() == Some(key)
                }),
            };
            if matches != Some(true) {
                return Err(PoolError::Inconsistency(
                    "chunk index entry does not match its segment",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.buffer_epoch.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn pages_needed(&self, num_bytes: usize) -> usize {
        num_bytes.div_ceil(self.config.page_size)
    }

    /// Runs `f` on the referenced segment. Must not be called while holding
    /// the unsized-list lock; it takes that lock itself for placeholders.
    pub(crate) fn with_segment_mut<R>(
        &self,
        state: &mut SizedState,
        seg_ref: SegRef,
        f: impl FnOnce(&mut Segment) -> R,
    ) -> Option<R> {
        match seg_ref.slab {
            Some(slab_num) => state
                .slab_segments
                .get_mut(slab_num)?
                .get_mut(seg_ref.handle)
                .map(f),
            None => self.unsized_segs.lock().get_mut(seg_ref.handle).map(f),
        }
    }
}

impl ParentStore for BufferPool {
    fn fetch(&self, key: &ChunkKey, dest: &Buffer, num_bytes: usize) -> Result<()> {
        BufferPool::fetch(self, key, dest, num_bytes)
    }

    fn put(&self, key: &ChunkKey, src: &Buffer) -> Result<()> {
        BufferPool::put(self, key, src, 0)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("num_chunks", &self.num_chunks())
            .field("allocated_bytes", &self.allocated_bytes())
            .finish()
    }
}

fn copy_chunk(
    src: &Buffer,
    dest: &Buffer,
    src_offset: usize,
    dest_offset: usize,
    len: usize,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let mut tmp = vec![0u8; len];
    src.read(&mut tmp, len, src_offset)?;
    dest.write_raw(&tmp, dest_offset)
}
