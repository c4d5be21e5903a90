use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferMeta};
use crate::error::{PoolError, Result};
use crate::key::ChunkKey;

/// Upstream, slower memory tier.
///
/// A pool forwards misses to its parent and flushes dirty chunks down on
/// checkpoint. [`BufferPool`](crate::BufferPool) implements this trait
/// itself, so pools stack into a hierarchy with an arbitrary terminal tier.
pub trait ParentStore: Send + Sync {
    /// Populates `dest` with the chunk's contents. `num_bytes == 0` means
    /// the full chunk.
    fn fetch(&self, key: &ChunkKey, dest: &Buffer, num_bytes: usize) -> Result<()>;

    /// Persists the chunk from `src` into this tier.
    fn put(&self, key: &ChunkKey, src: &Buffer) -> Result<()>;
}

struct StoredChunk {
    bytes: Vec<u8>,
    meta: BufferMeta,
}

/// Heap-backed terminal tier.
///
/// Serves as the bottom of a pool stack and as the backing store in tests;
/// it keeps whole chunks keyed by chunk key and counts `put` calls so
/// checkpoint behavior is observable.
#[derive(Default)]
pub struct MemStore {
    chunks: Mutex<BTreeMap<ChunkKey, StoredChunk>>,
    puts: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a chunk directly, bypassing the buffer path.
    pub fn insert(&self, key: ChunkKey, bytes: Vec<u8>) {
        self.chunks.lock().insert(
            key,
            StoredChunk {
                bytes,
                meta: BufferMeta::default(),
            },
        );
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.chunks.lock().contains_key(key)
    }

    pub fn chunk(&self, key: &ChunkKey) -> Option<Vec<u8>> {
        self.chunks.lock().get(key).map(|c| c.bytes.clone())
    }

    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Number of `put` calls received since construction.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ParentStore for MemStore {
    fn fetch(&self, key: &ChunkKey, dest: &Buffer, num_bytes: usize) -> Result<()> {
        let (bytes, meta) = {
            let chunks = self.chunks.lock();
            let stored = chunks.get(key).ok_or(PoolError::NotFound)?;
            let len = if num_bytes == 0 {
                stored.bytes.len()
            } else {
                num_bytes
            };
            if len > stored.bytes.len() {
                return Err(PoolError::NotFound);
            }
            (stored.bytes[..len].to_vec(), stored.meta)
        };
        dest.reserve(bytes.len())?;
        dest.write_raw(&bytes, 0)?;
        dest.set_size(bytes.len())?;
        dest.set_meta(meta);
        Ok(())
    }

    fn put(&self, key: &ChunkKey, src: &Buffer) -> Result<()> {
        let size = src.size();
        let mut bytes = vec![0u8; size];
        src.read(&mut bytes, size, 0)?;
        self.chunks.lock().insert(
            key.clone(),
            StoredChunk {
                bytes,
                meta: src.meta(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
