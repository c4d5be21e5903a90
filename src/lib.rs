#![forbid(unsafe_code)]
//! Hierarchical paged buffer pool.
//!
//! A [`BufferPool`] fronts a slower parent tier with a fixed-capacity arena
//! of fixed-size slabs, carved into pages. Consumers address chunks by
//! ordered integer keys and receive pinned [`BufferHandle`]s; pinned chunks
//! are immune to eviction, and unpinned ones are reclaimed by an LRU-scored
//! contiguous-window scan when the arena runs out. Pools implement
//! [`ParentStore`] themselves, so tiers stack: a small fast pool can front a
//! large slow one, which fronts a terminal store.
//!
//! ```
//! use tierpool::{BufferPool, ChunkKey, PoolConfig};
//!
//! let pool = BufferPool::host(PoolConfig::default(), None)?;
//! let key = ChunkKey::from([1, 2]);
//! let chunk = pool.create(&key, 0, 1024)?;
//! chunk.write(b"hello", 0)?;
//! let mut out = [0u8; 5];
//! chunk.read(&mut out, 5, 0)?;
//! assert_eq!(&out, b"hello");
//! drop(chunk);
//! pool.delete(&key)?;
//! # Ok::<(), tierpool::PoolError>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod key;
pub mod parent;
pub mod pool;
pub mod segment;
pub mod slab;

pub use crate::buffer::{Buffer, BufferHandle, BufferMeta};
pub use crate::config::PoolConfig;
pub use crate::error::{PoolError, Result};
pub use crate::key::ChunkKey;
pub use crate::parent::{MemStore, ParentStore};
pub use crate::pool::{BufferPool, PoolStats, SegmentInfo};
pub use crate::segment::{SegHandle, SegStatus, Segment, SegmentList};
pub use crate::slab::{HostSlabMemory, Slab, SlabMemory};
