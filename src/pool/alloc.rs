//! Free-space search, eviction, growth, and segment removal.
//!
//! All functions here run with the caller holding the structural (`sized`)
//! lock; the chunk index is taken underneath it where eviction or migration
//! must repoint entries.

use std::sync::Arc;

use tracing::debug;

use crate::buffer::MemBinding;
use crate::error::{PoolError, Result};
use crate::key::ChunkKey;
use crate::pool::{BufferPool, SegRef, SizedState};
use crate::segment::{SegHandle, SegStatus, Segment, SegmentList};

impl BufferPool {
    /// Grows the chunk's reservation to cover `num_bytes`. Reservations
    /// never shrink. The caller must hold a pin on the chunk's buffer so the
    /// evictor cannot select it while it is being reshaped.
    pub(crate) fn reserve_bytes(&self, key: &ChunkKey, num_bytes: usize) -> Result<()> {
        let mut state = self.sized.lock();
        let seg_ref = {
            let index = self.chunk_index.lock();
            *index.get(key).ok_or(PoolError::NotFound)?
        };
        let n = self.pages_needed(num_bytes);
        let (cur_pages, buffer) = match seg_ref.slab {
            Some(s) => {
                let seg = state
                    .slab_segments
                    .get(s)
                    .and_then(|list| list.get(seg_ref.handle))
                    .ok_or(PoolError::Inconsistency("chunk index holds a stale handle"))?;
                (seg.num_pages, seg.buffer.clone())
            }
            None => {
                let unsized_segs = self.unsized_segs.lock();
                let seg = unsized_segs
                    .get(seg_ref.handle)
                    .ok_or(PoolError::Inconsistency("chunk index holds a stale handle"))?;
                (seg.num_pages, seg.buffer.clone())
            }
        };
        if n <= cur_pages {
            return Ok(());
        }
        let buffer =
            buffer.ok_or(PoolError::Inconsistency("segment has no buffer attached"))?;

        // Cheapest growth: absorb pages from a free right-hand neighbour.
        if let Some(slab_num) = seg_ref.slab {
            let extra = n - cur_pages;
            let list = &mut state.slab_segments[slab_num];
            if let Some(next_h) = list.next(seg_ref.handle) {
                let absorbable = list
                    .get(next_h)
                    .is_some_and(|nx| nx.is_free() && nx.num_pages >= extra);
                if absorbable {
                    let next_start = {
                        let seg = list
                            .get_mut(seg_ref.handle)
                            .ok_or(PoolError::Inconsistency("segment vanished during growth"))?;
                        seg.num_pages = n;
                        seg.start_page + n
                    };
                    let leftover = {
                        let nx = list
                            .get_mut(next_h)
                            .ok_or(PoolError::Inconsistency("neighbour vanished during growth"))?;
                        nx.num_pages -= extra;
                        nx.start_page = next_start;
                        nx.num_pages
                    };
                    if leftover == 0 {
                        list.remove(next_h);
                    }
                    buffer.extend_capacity(n * self.config.page_size);
                    return Ok(());
                }
            }
        }

        // Otherwise migrate: claim a fresh run, move the binding over, copy
        // any live bytes, and retire the old segment.
        let new_ref = self.find_free_buffer(&mut state, num_bytes)?;
        let (new_slab, new_start) = match new_ref.slab {
            Some(s) => {
                let seg = state.slab_segments[s]
                    .get_mut(new_ref.handle)
                    .ok_or(PoolError::Inconsistency("fresh segment vanished"))?;
                seg.buffer = Some(buffer.clone());
                seg.chunk_key = Some(key.clone());
                (s, seg.start_page)
            }
            None => {
                return Err(PoolError::Inconsistency(
                    "allocator returned an unplaced segment",
                ))
            }
        };
        let binding = MemBinding {
            storage: state.slabs[new_slab].storage(),
            offset: new_start * self.config.page_size,
            capacity: n * self.config.page_size,
        };
        let live_bytes = buffer.size();
        let old_binding = buffer.rebind(binding.clone());
        if let Some(old) = old_binding {
            if live_bytes > 0 {
                copy_between(&old, &binding, live_bytes);
            }
        }
        self.remove_segment(&mut state, seg_ref);
        self.chunk_index.lock().insert(key.clone(), new_ref);
        debug!(%key, pages = n, slab = new_slab, "migrated chunk to a new page run");
        Ok(())
    }

    /// Locates or manufactures a free run of `ceil(num_bytes / page_size)`
    /// contiguous pages: first-fit over existing slabs, then slab growth,
    /// then eviction.
    pub(crate) fn find_free_buffer(
        &self,
        state: &mut SizedState,
        num_bytes: usize,
    ) -> Result<SegRef> {
        debug_assert!(num_bytes > 0);
        let n = self.pages_needed(num_bytes);
        if n > self.config.num_pages_per_slab() {
            return Err(PoolError::TooLarge {
                requested: num_bytes,
                slab_size: self.config.slab_size,
            });
        }
        for slab_num in 0..state.slab_segments.len() {
            if let Some(handle) = self.find_free_in_slab(state, slab_num, n) {
                return Ok(SegRef {
                    slab: Some(slab_num),
                    handle,
                });
            }
        }
        if state.slab_segments.len() < self.config.max_num_slabs() {
            self.add_slab(state)?;
            let slab_num = state.slab_segments.len() - 1;
            // a fresh slab always satisfies: n <= pages per slab
            let handle = self
                .find_free_in_slab(state, slab_num, n)
                .ok_or(PoolError::Inconsistency("fresh slab could not satisfy request"))?;
            return Ok(SegRef {
                slab: Some(slab_num),
                handle,
            });
        }
        match self.pick_eviction_window(state, n) {
            Some((slab_num, start, score)) => {
                debug!(slab = slab_num, pages = n, score, "evicting window");
                let handle = self.evict_window(state, slab_num, start, n)?;
                Ok(SegRef {
                    slab: Some(slab_num),
                    handle,
                })
            }
            None => Err(PoolError::OutOfMemory {
                requested: num_bytes,
            }),
        }
    }

    /// First-fit search inside one slab. On a hit the segment flips to USED
    /// with exactly `n` pages and any excess becomes a free tail segment.
    fn find_free_in_slab(
        &self,
        state: &mut SizedState,
        slab_num: usize,
        n: usize,
    ) -> Option<SegHandle> {
        let list = &mut state.slab_segments[slab_num];
        let mut cursor = list.head();
        while let Some(h) = cursor {
            let hit = list
                .get(h)
                .filter(|seg| seg.is_free() && seg.num_pages >= n)
                .map(|seg| (seg.start_page + n, seg.num_pages - n));
            if let Some((excess_start, excess)) = hit {
                let epoch = self.next_epoch();
                let seg = list.get_mut(h)?;
                seg.status = SegStatus::Used;
                seg.num_pages = n;
                seg.last_touched = epoch;
                seg.slab = Some(slab_num);
                if excess > 0 {
                    list.insert_after(h, Segment::free(excess_start, excess));
                }
                return Some(h);
            }
            cursor = list.next(h);
        }
        None
    }

    fn add_slab(&self, state: &mut SizedState) -> Result<()> {
        let slab = self.memory.alloc_slab(self.config.slab_size)?;
        if slab.len() != self.config.slab_size {
            return Err(PoolError::Inconsistency("memory tier returned a mis-sized slab"));
        }
        let mut list = SegmentList::new();
        list.push_back(Segment::free(0, self.config.num_pages_per_slab()));
        state.slabs.push(slab);
        state.slab_segments.push(list);
        state.stats.slabs_allocated += 1;
        debug!(
            slab = state.slabs.len() - 1,
            bytes = self.config.slab_size,
            "added slab to pool"
        );
        Ok(())
    }

    /// Scores every contiguous candidate window and returns the cheapest.
    ///
    /// A window accumulates segments forward from its start until it covers
    /// `n` pages; its score is the sum of `last_touched` over the USED
    /// segments it would destroy, so free pages and cold chunks are
    /// preferred. A pinned segment ends the window it falls in (including a
    /// window that starts on it) without disqualifying later start points.
    /// When a walk runs off the slab end, every later start in that slab
    /// would too, so the slab scan stops there.
    fn pick_eviction_window(
        &self,
        state: &SizedState,
        n: usize,
    ) -> Option<(usize, SegHandle, u64)> {
        let mut best: Option<(usize, SegHandle, u64)> = None;
        for (slab_num, list) in state.slab_segments.iter().enumerate() {
            let mut start = list.head();
            while let Some(b) = start {
                let mut page_count = 0usize;
                let mut score = 0u64;
                let mut walker = Some(b);
                let mut satisfied = false;
                while let Some(h) = walker {
                    let seg = match list.get(h) {
                        Some(seg) => seg,
                        None => break,
                    };
                    if seg.status == SegStatus::Used && seg.pin_count() > 0 {
                        break;
                    }
                    page_count += seg.num_pages;
                    if seg.status == SegStatus::Used {
                        score += seg.last_touched;
                    }
                    if page_count >= n {
                        satisfied = true;
                        break;
                    }
                    walker = list.next(h);
                }
                if satisfied {
                    if best.map_or(true, |(_, _, s)| score < s) {
                        best = Some((slab_num, b, score));
                    }
                } else if walker.is_none() {
                    break;
                }
                start = list.next(b);
            }
        }
        best
    }

    /// Destroys the chosen window and installs a USED segment of `n` pages
    /// in its place, reconciling any excess into a free tail.
    fn evict_window(
        &self,
        state: &mut SizedState,
        slab_num: usize,
        start: SegHandle,
        n: usize,
    ) -> Result<SegHandle> {
        let epoch = self.next_epoch();
        let mut index = self.chunk_index.lock();
        let list = &mut state.slab_segments[slab_num];
        let start_page = list
            .get(start)
            .ok_or(PoolError::Inconsistency("eviction start segment vanished"))?
            .start_page;
        let mut pages = 0usize;
        let mut evicted_chunks = 0u64;
        let mut evicted_pages = 0u64;
        let mut cursor = Some(start);
        while pages < n {
            let h = cursor.ok_or(PoolError::Inconsistency("eviction window ran past the slab"))?;
            cursor = list.next(h);
            let seg = list
                .remove(h)
                .ok_or(PoolError::Inconsistency("eviction window segment vanished"))?;
            if seg.status == SegStatus::Used {
                debug_assert_eq!(seg.pin_count(), 0, "evicting a pinned segment");
                if let Some(key) = &seg.chunk_key {
                    index.remove(key);
                }
                if let Some(buffer) = &seg.buffer {
                    buffer.unbind();
                }
                evicted_chunks += 1;
                evicted_pages += seg.num_pages as u64;
            }
            pages += seg.num_pages;
        }
        drop(index);
        let mut claimed = Segment::used(start_page, n, epoch);
        claimed.slab = Some(slab_num);
        let new_handle = match cursor {
            Some(c) => list
                .insert_before(c, claimed)
                .ok_or(PoolError::Inconsistency("lost position rebuilding eviction window"))?,
            None => list.push_back(claimed),
        };
        if pages > n {
            let excess = pages - n;
            let merged = cursor
                .and_then(|c| list.get_mut(c))
                .filter(|nx| nx.is_free())
                .map(|nx| {
                    nx.start_page = start_page + n;
                    nx.num_pages += excess;
                });
            if merged.is_none() {
                let free_tail = Segment::free(start_page + n, excess);
                match cursor {
                    Some(c) => {
                        list.insert_before(c, free_tail);
                    }
                    None => {
                        list.push_back(free_tail);
                    }
                }
            }
        }
        state.stats.evictions += evicted_chunks;
        state.stats.evicted_pages += evicted_pages;
        Ok(new_handle)
    }

    /// Retires a segment: placeholders are erased; placed segments flip to
    /// FREE and merge with free neighbours on both sides. The buffer object
    /// is not touched; the caller owns its teardown.
    pub(crate) fn remove_segment(&self, state: &mut SizedState, seg_ref: SegRef) {
        match seg_ref.slab {
            None => {
                self.unsized_segs.lock().remove(seg_ref.handle);
            }
            Some(slab_num) => {
                let Some(list) = state.slab_segments.get_mut(slab_num) else {
                    return;
                };
                let h = seg_ref.handle;
                if !list.contains(h) {
                    return;
                }
                if let Some(prev_h) = list.prev(h) {
                    if list.get(prev_h).is_some_and(Segment::is_free) {
                        if let Some(prev) = list.remove(prev_h) {
                            if let Some(seg) = list.get_mut(h) {
                                seg.start_page = prev.start_page;
                                seg.num_pages += prev.num_pages;
                            }
                        }
                    }
                }
                if let Some(next_h) = list.next(h) {
                    if list.get(next_h).is_some_and(Segment::is_free) {
                        if let Some(next) = list.remove(next_h) {
                            if let Some(seg) = list.get_mut(h) {
                                seg.num_pages += next.num_pages;
                            }
                        }
                    }
                }
                if let Some(seg) = list.get_mut(h) {
                    seg.status = SegStatus::Free;
                    seg.slab = None;
                    seg.buffer = None;
                    seg.chunk_key = None;
                }
            }
        }
    }
}

/// Copies `len` bytes across bindings. When both runs live in the same slab
/// the ranges are disjoint (old and new segments coexist), so a single write
/// guard with `copy_within` suffices.
fn copy_between(old: &MemBinding, new: &MemBinding, len: usize) {
    if Arc::ptr_eq(&old.storage, &new.storage) {
        let mut guard = new.storage.write();
        guard.copy_within(old.offset..old.offset + len, new.offset);
    } else {
        let src = old.storage.read();
        let mut dst = new.storage.write();
        dst[new.offset..new.offset + len].copy_from_slice(&src[old.offset..old.offset + len]);
    }
}
