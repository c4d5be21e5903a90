//! End-to-end allocation, eviction, and hierarchy scenarios over a small
//! pool: 512-byte pages, 4096-byte slabs, two slabs of arena.

use std::sync::Arc;

use tierpool::{Buffer, BufferPool, ChunkKey, MemStore, PoolConfig, PoolError, SegmentInfo};

fn small_config() -> PoolConfig {
    PoolConfig {
        page_size: 512,
        slab_size: 4096,
        max_buffer_size: 8192,
        device_id: 0,
    }
}

fn small_pool() -> Arc<BufferPool> {
    BufferPool::host(small_config(), None).expect("pool")
}

fn layout(info: &SegmentInfo) -> (usize, usize, bool) {
    (info.start_page, info.num_pages, info.is_free)
}

#[test]
fn fills_first_slab_front_to_back() {
    let pool = small_pool();

    let a = pool.create(&ChunkKey::from([1]), 0, 1024).expect("create [1]");
    {
        let slabs = pool.slab_layouts();
        assert_eq!(slabs.len(), 1);
        assert_eq!(layout(&slabs[0][0]), (0, 2, false));
        assert_eq!(layout(&slabs[0][1]), (2, 6, true));
    }

    let b = pool.create(&ChunkKey::from([2]), 0, 1024).expect("create [2]");
    {
        let slabs = pool.slab_layouts();
        assert_eq!(layout(&slabs[0][1]), (2, 2, false));
        assert_eq!(layout(&slabs[0][2]), (4, 4, true));
    }

    drop((a, b));
    pool.verify_integrity().expect("integrity");
}

#[test]
fn grows_second_slab_when_tail_is_too_small() {
    let pool = small_pool();
    let a = pool.create(&ChunkKey::from([1]), 0, 1024).expect("create [1]");
    let b = pool.create(&ChunkKey::from([2]), 0, 1024).expect("create [2]");
    drop((a, b));

    // six pages wanted, only four free in slab 0
    let _c = pool.create(&ChunkKey::from([3]), 0, 3072).expect("create [3]");
    let slabs = pool.slab_layouts();
    assert_eq!(slabs.len(), 2);
    assert_eq!(layout(&slabs[1][0]), (0, 6, false));
    assert_eq!(slabs[1][0].chunk_key, Some(ChunkKey::from([3])));
    assert_eq!(layout(&slabs[1][1]), (6, 2, true));
    assert_eq!(pool.allocated_bytes(), 8192);
    pool.verify_integrity().expect("integrity");
}

#[test]
fn eviction_reclaims_the_coldest_window() {
    let pool = small_pool();
    // tile the whole arena: [1] and [2] up front, [3] in slab 1, then the
    // leftovers, so nothing free remains
    for (key, size) in [([1], 1024), ([2], 1024), ([3], 3072), ([9], 2048), ([10], 1024)] {
        let handle = pool.create(&ChunkKey::from(key), 0, size).expect("create");
        drop(handle);
    }
    assert!(pool
        .slab_layouts()
        .iter()
        .flatten()
        .all(|info| !info.is_free));

    // [1] carries the oldest stamp, so its pages are the cheapest window
    let _d = pool.create(&ChunkKey::from([4]), 0, 1024).expect("evicting create");
    assert!(!pool.is_resident(&ChunkKey::from([1])));
    for key in [[2], [3], [4], [9], [10]] {
        assert!(pool.is_resident(&ChunkKey::from(key)), "chunk {key:?} survived");
    }
    let slabs = pool.slab_layouts();
    assert_eq!(layout(&slabs[0][0]), (0, 2, false));
    assert_eq!(slabs[0][0].chunk_key, Some(ChunkKey::from([4])));
    assert_eq!(pool.stats().evictions, 1);
    pool.verify_integrity().expect("integrity");
}

#[test]
fn lru_order_follows_pin_history() {
    let pool = small_pool();
    let handles: Vec<_> = (1..=4)
        .map(|i| pool.create(&ChunkKey::from([i]), 0, 2048).expect("create"))
        .collect();
    drop(handles);

    // one chunk's worth of pressure evicts exactly the first-touched chunk
    let _e = pool.create(&ChunkKey::from([5]), 0, 2048).expect("create under pressure");
    assert!(!pool.is_resident(&ChunkKey::from([1])));
    for key in [[2], [3], [4], [5]] {
        assert!(pool.is_resident(&ChunkKey::from(key)));
    }
    pool.verify_integrity().expect("integrity");
}

#[test]
fn pinned_chunk_survives_pressure_to_out_of_memory() {
    let pool = small_pool();
    let pinned = pool.create(&ChunkKey::from([1]), 0, 2048).expect("create pinned");

    let mut pressure = Vec::new();
    let mut next = 10;
    let err = loop {
        match pool.create(&ChunkKey::from([next]), 0, 4096) {
            Ok(handle) => pressure.push(handle),
            Err(err) => break err,
        }
        next += 1;
    };
    assert!(matches!(err, PoolError::OutOfMemory { .. }));
    assert!(pool.is_resident(&ChunkKey::from([1])));
    assert_eq!(pinned.pin_count(), 1);
    pool.verify_integrity().expect("integrity");
}

#[test]
fn resize_preserves_contents_through_absorb_and_migrate() {
    let pool = small_pool();

    // growth into the adjacent free tail
    let a = pool.create(&ChunkKey::from([1]), 0, 1024).expect("create");
    a.write(&[11u8; 1024], 0).expect("fill");
    a.reserve(2048).expect("grow");
    let mut out = vec![0u8; 1024];
    a.read(&mut out, 1024, 0).expect("read");
    assert!(out.iter().all(|&x| x == 11));

    // growth when the neighbour is occupied forces a move
    let _b = pool.create(&ChunkKey::from([2]), 0, 1024).expect("neighbour");
    a.reserve(3072).expect("grow past neighbour");
    a.read(&mut out, 1024, 0).expect("read after move");
    assert!(out.iter().all(|&x| x == 11));
    pool.verify_integrity().expect("integrity");
}

#[test]
fn delete_prefix_removes_exactly_the_prefix() {
    let pool = small_pool();
    for key in [vec![1, 0], vec![1, 1], vec![2, 0]] {
        let handle = pool.create(&ChunkKey::from(key), 0, 512).expect("create");
        drop(handle);
    }

    pool.delete_prefix(&ChunkKey::from([1])).expect("delete prefix");
    assert!(!pool.is_resident(&ChunkKey::from([1, 0])));
    assert!(!pool.is_resident(&ChunkKey::from([1, 1])));
    assert!(pool.is_resident(&ChunkKey::from([2, 0])));

    // an absent prefix is silently tolerated
    pool.delete_prefix(&ChunkKey::from([7])).expect("no-op prefix");
    assert_eq!(pool.num_chunks(), 1);
    pool.verify_integrity().expect("integrity");
}

#[test]
fn checkpoint_flushes_each_dirty_chunk_once() {
    let parent = Arc::new(MemStore::new());
    let pool = BufferPool::host(small_config(), Some(parent.clone())).expect("pool");

    let buf = pool.create(&ChunkKey::from([5, 1]), 0, 0).expect("create");
    buf.write(b"dirty bytes", 0).expect("write");
    assert!(buf.is_dirty());

    pool.checkpoint().expect("checkpoint");
    assert_eq!(parent.put_count(), 1);
    assert_eq!(
        parent.chunk(&ChunkKey::from([5, 1])).as_deref(),
        Some(&b"dirty bytes"[..])
    );
    assert!(!buf.is_dirty());

    // nothing new to flush
    pool.checkpoint().expect("second checkpoint");
    assert_eq!(parent.put_count(), 1);
}

#[test]
fn checkpoint_skips_anonymous_chunks() {
    let parent = Arc::new(MemStore::new());
    let pool = BufferPool::host(small_config(), Some(parent.clone())).expect("pool");

    let anon = pool.alloc(512).expect("alloc");
    anon.write(b"scratch", 0).expect("write");
    pool.checkpoint().expect("checkpoint");
    assert_eq!(parent.put_count(), 0);
}

#[test]
fn get_faults_chunks_in_from_the_parent() {
    let parent = Arc::new(MemStore::new());
    parent.insert(ChunkKey::from([8, 8]), b"tiered data".to_vec());
    let pool = BufferPool::host(small_config(), Some(parent)).expect("pool");

    let buf = pool.get(&ChunkKey::from([8, 8]), 0).expect("fault in");
    assert_eq!(buf.size(), 11);
    let mut out = vec![0u8; 11];
    buf.read(&mut out, 11, 0).expect("read");
    assert_eq!(&out, b"tiered data");
    assert!(pool.is_resident(&ChunkKey::from([8, 8])));
    assert_eq!(pool.stats().misses, 1);
}

#[test]
fn failed_parent_fetch_tears_the_fresh_chunk_down() {
    let parent = Arc::new(MemStore::new());
    let pool = BufferPool::host(small_config(), Some(parent)).expect("pool");

    assert!(matches!(
        pool.get(&ChunkKey::from([6]), 0),
        Err(PoolError::NotFound)
    ));
    assert!(!pool.is_resident(&ChunkKey::from([6])));
    pool.verify_integrity().expect("integrity");
}

#[test]
fn put_then_fetch_round_trips_contents() {
    let pool = small_pool();

    let src = Buffer::standalone(512, 0);
    src.write(b"round trip payload", 0).expect("stage");
    pool.put(&ChunkKey::from([3, 3]), &src, 0).expect("put");
    assert!(!src.is_dirty(), "put clears source dirty bits");

    let dest = Buffer::standalone(512, 0);
    pool.fetch(&ChunkKey::from([3, 3]), &dest, 0).expect("fetch");
    assert_eq!(dest.size(), 18);
    let mut out = vec![0u8; 18];
    dest.read(&mut out, 18, 0).expect("read");
    assert_eq!(&out, b"round trip payload");
}

#[test]
fn put_over_dirty_chunk_is_a_conflict() {
    let pool = small_pool();
    let buf = pool.create(&ChunkKey::from([1]), 0, 0).expect("create");
    buf.write(b"unflushed", 0).expect("write");

    let src = Buffer::standalone(512, 0);
    src.write(b"late arrival", 0).expect("stage");
    assert!(matches!(
        pool.put(&ChunkKey::from([1]), &src, 0),
        Err(PoolError::Inconsistency(_))
    ));
}

#[test]
fn appended_put_only_ships_the_tail() {
    let parent = Arc::new(MemStore::new());
    let pool = BufferPool::host(small_config(), Some(parent)).expect("pool");

    let src = Buffer::standalone(512, 0);
    src.write(b"head", 0).expect("stage head");
    pool.put(&ChunkKey::from([4]), &src, 0).expect("first put");
    // flush the pool copy; a second put over a dirty chunk is a conflict
    pool.checkpoint().expect("checkpoint");

    src.append(b"-tail").expect("stage tail");
    pool.put(&ChunkKey::from([4]), &src, 0).expect("appending put");

    let dest = Buffer::standalone(512, 0);
    pool.fetch(&ChunkKey::from([4]), &dest, 0).expect("fetch");
    let mut out = vec![0u8; 9];
    dest.read(&mut out, 9, 0).expect("read");
    assert_eq!(&out, b"head-tail");
}

#[test]
fn pools_stack_into_a_hierarchy() {
    let store = Arc::new(MemStore::new());
    store.insert(ChunkKey::from([1, 1]), b"bottom tier".to_vec());

    let slow = BufferPool::host(
        PoolConfig {
            page_size: 512,
            slab_size: 8192,
            max_buffer_size: 16384,
            device_id: 1,
        },
        Some(store.clone()),
    )
    .expect("slow tier");
    let fast = BufferPool::host(small_config(), Some(slow.clone())).expect("fast tier");

    // a miss in the fast tier pulls the chunk through the slow tier
    let buf = fast.get(&ChunkKey::from([1, 1]), 0).expect("fault through");
    let mut out = vec![0u8; 11];
    buf.read(&mut out, 11, 0).expect("read");
    assert_eq!(&out, b"bottom tier");
    assert!(slow.is_resident(&ChunkKey::from([1, 1])));

    // a write in the fast tier flows back down checkpoint by checkpoint
    buf.write(b"mutated tier", 0).expect("write");
    fast.checkpoint().expect("fast checkpoint");
    slow.checkpoint().expect("slow checkpoint");
    assert_eq!(
        store.chunk(&ChunkKey::from([1, 1])).as_deref(),
        Some(&b"mutated tier"[..])
    );
}

#[test]
fn deleted_chunks_stay_gone_until_recreated() {
    let pool = small_pool();
    let handle = pool.create(&ChunkKey::from([2, 2]), 0, 512).expect("create");
    drop(handle);
    pool.delete(&ChunkKey::from([2, 2])).expect("delete");
    assert!(matches!(
        pool.get(&ChunkKey::from([2, 2]), 0),
        Err(PoolError::NotFound)
    ));
    let _again = pool.create(&ChunkKey::from([2, 2]), 0, 512).expect("recreate");
    assert!(pool.is_resident(&ChunkKey::from([2, 2])));
}
