use core::ptr::NonNull;
use std::sync::atomic::{
  AtomicU64,
  AtomicUsize,
  Ordering,
};

use getset::CopyGetters;
use pagepool_list::{
  Key,
  Linked,
  ListHead,
  Slab,
};
use spin::Mutex;

use crate::{
  chunk::{
    Chunk,
    Handle,
  },
  chunk_list::{
    ChunkLists,
    ALLOC_ORDER,
  },
  classes::{
    classify,
    n_small,
    small_idx,
    tiny_idx,
    SizeClass,
    N_TINY,
    SMALL_THRESHOLD,
  },
  config::{
    PoolConfig,
    PoolResult,
  },
  subpage::Subpage,
};

/// A placed allocation. `ptr` is the absolute data pointer, so cache hits
/// and buffer access never have to look the chunk up again; `chunk` and
/// `handle` carry everything the free path needs.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
  pub chunk: Key,
  pub handle: Handle,
  pub ptr: NonNull<u8>,
  pub norm: usize,
}

#[derive(Debug, Default)]
struct Counters {
  tiny: AtomicU64,
  small: AtomicU64,
  normal: AtomicU64,
  huge: AtomicU64,
  deallocations: AtomicU64,
  active_bytes: AtomicUsize,
}

/// Point-in-time counters for one arena.
#[derive(Debug, Clone)]
pub struct ArenaMetrics {
  pub n_chunks: usize,
  pub n_thread_caches: usize,
  pub tiny_allocations: u64,
  pub small_allocations: u64,
  pub normal_allocations: u64,
  pub huge_allocations: u64,
  pub deallocations: u64,
  pub active_bytes: usize,
}

struct Shared {
  chunks: Slab<Chunk>,
  lists: ChunkLists,
  subpages: Slab<Subpage>,
  /// Partially filled subpages per class, tiny classes first, then the
  /// power-of-two small classes.
  pools: Vec<ListHead>,
  /// Pooled chunks only; unpooled mappings come and go with their
  /// allocation.
  pooled_chunks: usize,
}

/// One independent slice of the pool. Chunk and subpage state sits behind a
/// single mutex; counters live outside it.
#[derive(CopyGetters)]
pub struct Arena {
  #[getset(get_copy = "pub")]
  page_size: usize,
  #[getset(get_copy = "pub")]
  page_shifts: u32,
  #[getset(get_copy = "pub")]
  max_order: u32,
  #[getset(get_copy = "pub")]
  chunk_size: usize,
  shared: Mutex<Shared>,
  num_thread_caches: AtomicUsize,
  counters: Counters,
}

impl Arena {
  pub fn new(config: &PoolConfig) -> Self {
    let page_shifts = config.page_shifts();
    let n_pools = N_TINY + n_small(page_shifts);

    Self {
      page_size: config.page_size,
      page_shifts,
      max_order: config.max_order,
      chunk_size: config.chunk_size(),
      shared: Mutex::new(Shared {
        chunks: Slab::new(),
        lists: ChunkLists::new(),
        subpages: Slab::new(),
        pools: (0..n_pools).map(|_| ListHead::new()).collect(),
        pooled_chunks: 0,
      }),
      num_thread_caches: AtomicUsize::new(0),
      counters: Counters::default(),
    }
  }

  fn pool_idx(norm: usize) -> usize {
    if norm < SMALL_THRESHOLD {
      tiny_idx(norm)
    } else {
      N_TINY + small_idx(norm)
    }
  }

  /// Places `norm` bytes, which must already be a normalized capacity.
  pub fn allocate(&self, norm: usize) -> PoolResult<Allocation> {
    let class = classify(norm, self.page_size, self.chunk_size);
    let allocation = match class {
      SizeClass::Tiny | SizeClass::Small => self.allocate_subpage(norm)?,
      SizeClass::Normal => self.allocate_run(norm)?,
      SizeClass::Huge => self.allocate_huge(norm)?,
    };

    let counter = match class {
      SizeClass::Tiny => &self.counters.tiny,
      SizeClass::Small => &self.counters.small,
      SizeClass::Normal => &self.counters.normal,
      SizeClass::Huge => &self.counters.huge,
    };
    counter.fetch_add(1, Ordering::Relaxed);
    self
      .counters
      .active_bytes
      .fetch_add(norm, Ordering::Relaxed);

    Ok(allocation)
  }

  fn data_ptr(chunk: &Chunk, handle: Handle, elem_size: usize) -> NonNull<u8> {
    let offset = chunk.offset_of(handle, elem_size);
    // offsets stay inside the mapping, so the sum cannot wrap
    unsafe { NonNull::new_unchecked(chunk.base().as_ptr().add(offset)) }
  }

  fn allocate_subpage(&self, norm: usize) -> PoolResult<Allocation> {
    let mut guard = self.shared.lock();
    let shared = &mut *guard;
    let pool = Self::pool_idx(norm);

    if let Some(sp_key) = shared.pools[pool].front() {
      let sp = shared
        .subpages
        .get_mut(sp_key)
        .expect("pooled subpage key is live");
      let idx = sp.allocate().expect("pooled subpage has a free slot");
      let chunk_key = sp.chunk();
      let node = sp.node();

      if sp.is_full() {
        sp.set_in_pool(false);
        shared.pools[pool].remove(&mut shared.subpages, sp_key);
      }

      let handle = Handle::Elem {
        node,
        bitmap_idx: idx,
      };
      let chunk = shared.chunks.get(chunk_key).expect("subpage chunk is live");
      return Ok(Allocation {
        chunk: chunk_key,
        handle,
        ptr: Self::data_ptr(chunk, handle, norm),
        norm,
      });
    }

    // no partial subpage for this class, carve a fresh page
    let (chunk_key, node) = self.page_run(shared)?;

    let mut sp = Subpage::new(chunk_key, node, self.page_size, norm);
    let idx = sp.allocate().expect("fresh subpage has free slots");
    let sp_key = shared.subpages.insert(sp);
    shared
      .subpages
      .get_mut(sp_key)
      .expect("just inserted")
      .set_in_pool(true);
    shared.pools[pool].push_front(&mut shared.subpages, sp_key);
    shared
      .chunks
      .get_mut(chunk_key)
      .expect("subpage chunk is live")
      .set_subpage(node, Some(sp_key));

    let handle = Handle::Elem {
      node,
      bitmap_idx: idx,
    };
    let chunk = shared.chunks.get(chunk_key).expect("subpage chunk is live");
    Ok(Allocation {
      chunk: chunk_key,
      handle,
      ptr: Self::data_ptr(chunk, handle, norm),
      norm,
    })
  }

  /// Reserves one page from a listed chunk, mapping a new chunk when every
  /// bucket comes up empty. Buckets below `q100` always have a free page.
  fn page_run(&self, shared: &mut Shared) -> PoolResult<(Key, u32)> {
    for bucket in ALLOC_ORDER {
      if let Some(key) = shared.lists.front(bucket) {
        let node = shared
          .chunks
          .get_mut(key)
          .expect("listed chunk key is live")
          .allocate_page()
          .expect("chunk below q100 has a free page");
        shared.lists.migrate_up(&mut shared.chunks, key);
        return Ok((key, node));
      }
    }

    let mut chunk = Chunk::new(self.page_size, self.max_order)?;
    let node = chunk.allocate_page().expect("fresh chunk has free pages");
    let key = shared.chunks.insert(chunk);
    shared.pooled_chunks += 1;
    shared.lists.insert(&mut shared.chunks, key);
    Ok((key, node))
  }

  fn allocate_run(&self, norm: usize) -> PoolResult<Allocation> {
    let mut guard = self.shared.lock();
    let shared = &mut *guard;

    for bucket in ALLOC_ORDER {
      let mut cur = shared.lists.front(bucket);
      while let Some(key) = cur {
        cur = shared
          .chunks
          .get(key)
          .expect("listed chunk key is live")
          .link()
          .next();

        let chunk = shared.chunks.get_mut(key).expect("listed chunk key is live");
        if let Some(node) = chunk.allocate_run(norm) {
          shared.lists.migrate_up(&mut shared.chunks, key);
          let handle = Handle::Run { node };
          let chunk = shared.chunks.get(key).expect("listed chunk key is live");
          return Ok(Allocation {
            chunk: key,
            handle,
            ptr: Self::data_ptr(chunk, handle, 0),
            norm,
          });
        }
      }
    }

    // no listed chunk has a contiguous run of this length
    let mut chunk = Chunk::new(self.page_size, self.max_order)?;
    let node = chunk
      .allocate_run(norm)
      .expect("fresh chunk fits any normal run");
    let key = shared.chunks.insert(chunk);
    shared.pooled_chunks += 1;
    shared.lists.insert(&mut shared.chunks, key);

    let handle = Handle::Run { node };
    let chunk = shared.chunks.get(key).expect("just inserted");
    Ok(Allocation {
      chunk: key,
      handle,
      ptr: Self::data_ptr(chunk, handle, 0),
      norm,
    })
  }

  /// Oversized requests get a dedicated mapping sized to the request. The
  /// chunk sits in the slab for the free path but on no utilization list.
  fn allocate_huge(&self, norm: usize) -> PoolResult<Allocation> {
    let chunk = Chunk::new_unpooled(norm)?;
    let ptr = chunk.base();

    let key = self.shared.lock().chunks.insert(chunk);
    Ok(Allocation {
      chunk: key,
      handle: Handle::Run { node: 0 },
      ptr,
      norm,
    })
  }

  pub fn free(&self, allocation: Allocation) {
    let mut doomed = None;

    {
      let mut guard = self.shared.lock();
      let shared = &mut *guard;
      let chunk = shared
        .chunks
        .get(allocation.chunk)
        .expect("free targets a live chunk");

      if chunk.is_unpooled() {
        doomed = shared.chunks.remove(allocation.chunk);
      } else {
        match allocation.handle {
          Handle::Elem { node, bitmap_idx } => {
            Self::free_elem(shared, allocation.chunk, node, bitmap_idx, &mut doomed);
          }
          Handle::Run { node } => {
            shared
              .chunks
              .get_mut(allocation.chunk)
              .expect("free targets a live chunk")
              .free_run(node);
            Self::finish_run_free(shared, allocation.chunk, &mut doomed);
          }
        }
      }
    }

    self.counters.deallocations.fetch_add(1, Ordering::Relaxed);
    self
      .counters
      .active_bytes
      .fetch_sub(allocation.norm, Ordering::Relaxed);

    // munmap happens outside the lock
    drop(doomed);
  }

  fn free_elem(
    shared: &mut Shared,
    chunk_key: Key,
    node: u32,
    bitmap_idx: u32,
    doomed: &mut Option<Chunk>,
  ) {
    let sp_key = shared
      .chunks
      .get(chunk_key)
      .expect("free targets a live chunk")
      .subpage_at(node)
      .expect("elem free targets a subpage page");

    let sp = shared.subpages.get_mut(sp_key).expect("subpage key is live");
    let was_full = sp.is_full();
    sp.free(bitmap_idx);
    let pool = Self::pool_idx(sp.elem_size());

    if was_full {
      sp.set_in_pool(true);
      shared.pools[pool].push_front(&mut shared.subpages, sp_key);
      return;
    }

    // an empty subpage gives its page back unless it is the last one
    // keeping its class warm
    if sp.is_empty() && shared.pools[pool].len() > 1 {
      shared.pools[pool].remove(&mut shared.subpages, sp_key);
      shared.subpages.remove(sp_key);

      let chunk = shared
        .chunks
        .get_mut(chunk_key)
        .expect("free targets a live chunk");
      chunk.set_subpage(node, None);
      chunk.free_run(node);
      Self::finish_run_free(shared, chunk_key, doomed);
    }
  }

  /// Re-buckets a chunk after pages came back. A chunk that drains
  /// completely is kept and its pages reclaimed when it is the arena's only
  /// one, otherwise it is unmapped.
  fn finish_run_free(shared: &mut Shared, chunk_key: Key, doomed: &mut Option<Chunk>) {
    if shared.lists.migrate_down(&mut shared.chunks, chunk_key) {
      return;
    }

    if shared.pooled_chunks == 1 {
      let chunk = shared
        .chunks
        .get_mut(chunk_key)
        .expect("free targets a live chunk");
      if let Err(err) = chunk.reclaim() {
        log::warn!("failed to reclaim idle chunk: {err:?}");
      }
      shared.lists.insert(&mut shared.chunks, chunk_key);
    } else {
      shared.pooled_chunks -= 1;
      *doomed = shared.chunks.remove(chunk_key);
    }
  }

  pub fn register_cache(&self) {
    self.num_thread_caches.fetch_add(1, Ordering::Relaxed);
  }

  pub fn unregister_cache(&self) {
    self.num_thread_caches.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn num_thread_caches(&self) -> usize {
    self.num_thread_caches.load(Ordering::Relaxed)
  }

  pub fn metrics(&self) -> ArenaMetrics {
    let n_chunks = self.shared.lock().chunks.len();
    ArenaMetrics {
      n_chunks,
      n_thread_caches: self.num_thread_caches(),
      tiny_allocations: self.counters.tiny.load(Ordering::Relaxed),
      small_allocations: self.counters.small.load(Ordering::Relaxed),
      normal_allocations: self.counters.normal.load(Ordering::Relaxed),
      huge_allocations: self.counters.huge.load(Ordering::Relaxed),
      deallocations: self.counters.deallocations.load(Ordering::Relaxed),
      active_bytes: self.counters.active_bytes.load(Ordering::Relaxed),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classes::normalize_capacity;

  fn arena() -> Arena {
    Arena::new(&PoolConfig {
      page_size: 4096,
      max_order: 4,
      ..PoolConfig::default()
    })
  }

  fn alloc(arena: &Arena, req: usize) -> Allocation {
    let norm = normalize_capacity(req, arena.chunk_size());
    arena.allocate(norm).unwrap()
  }

  #[test]
  fn test_tiny_slots_share_a_page() {
    let a = arena();

    let x = alloc(&a, 32);
    let y = alloc(&a, 32);
    assert_ne!(x.ptr, y.ptr);
    assert_eq!(x.chunk, y.chunk);
    assert_eq!(x.handle.node(), y.handle.node());

    let m = a.metrics();
    assert_eq!(m.tiny_allocations, 2);
    assert_eq!(m.active_bytes, 64);
    assert_eq!(m.n_chunks, 1);

    a.free(x);
    a.free(y);
    assert_eq!(a.metrics().deallocations, 2);
    assert_eq!(a.metrics().active_bytes, 0);
  }

  #[test]
  fn test_freed_slot_is_reused() {
    let a = arena();

    let x = alloc(&a, 64);
    let ptr = x.ptr;
    a.free(x);

    let y = alloc(&a, 64);
    assert_eq!(y.ptr, ptr);
    a.free(y);
  }

  #[test]
  fn test_full_subpage_spills_to_new_page() {
    let a = arena();

    // 2048-byte class, two slots per 4096 page
    let x = alloc(&a, 2048);
    let y = alloc(&a, 2048);
    let z = alloc(&a, 2048);

    assert_eq!(x.handle.node(), y.handle.node());
    assert_ne!(x.handle.node(), z.handle.node());

    for alloc in [x, y, z] {
      a.free(alloc);
    }
  }

  #[test]
  fn test_subpage_slots_do_not_alias() {
    let a = arena();

    let allocs: Vec<Allocation> = (0..16).map(|_| alloc(&a, 256)).collect();
    for (i, alloc) in allocs.iter().enumerate() {
      unsafe {
        alloc.ptr.as_ptr().write_bytes(i as u8, 256);
      }
    }
    for (i, alloc) in allocs.iter().enumerate() {
      let byte = unsafe { alloc.ptr.as_ptr().read() };
      assert_eq!(byte, i as u8);
    }
    for alloc in allocs {
      a.free(alloc);
    }
  }

  #[test]
  fn test_sole_chunk_survives_drain() {
    let a = arena();

    let x = alloc(&a, 8192);
    assert_eq!(a.metrics().n_chunks, 1);
    a.free(x);
    // fully drained but retained, next allocation reuses the mapping
    assert_eq!(a.metrics().n_chunks, 1);

    let y = alloc(&a, 8192);
    assert_eq!(a.metrics().n_chunks, 1);
    a.free(y);
  }

  #[test]
  fn test_extra_chunks_are_unmapped() {
    let a = arena();
    let half = a.chunk_size() / 2;

    let r1 = alloc(&a, half);
    let r2 = alloc(&a, half);
    let r3 = alloc(&a, half);
    assert_eq!(a.metrics().n_chunks, 2);

    a.free(r1);
    a.free(r2);
    assert_eq!(a.metrics().n_chunks, 1);

    a.free(r3);
    assert_eq!(a.metrics().n_chunks, 1);
  }

  #[test]
  fn test_huge_maps_and_unmaps() {
    let a = arena();
    let size = 3 * a.chunk_size();

    let h = alloc(&a, size);
    assert_eq!(a.metrics().huge_allocations, 1);
    assert_eq!(a.metrics().n_chunks, 1);

    unsafe {
      h.ptr.as_ptr().write(0xEE);
      h.ptr.as_ptr().add(size - 1).write(0xFF);
      assert_eq!(h.ptr.as_ptr().read(), 0xEE);
    }

    a.free(h);
    assert_eq!(a.metrics().n_chunks, 0);
    assert_eq!(a.metrics().active_bytes, 0);
  }

  #[test]
  fn test_cache_registration_counts() {
    let a = arena();
    assert_eq!(a.num_thread_caches(), 0);
    a.register_cache();
    a.register_cache();
    assert_eq!(a.num_thread_caches(), 2);
    a.unregister_cache();
    assert_eq!(a.num_thread_caches(), 1);
  }
}
