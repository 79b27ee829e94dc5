use std::cell::RefCell;
use std::sync::Arc;

use pagepool_ring::Ring;

use crate::{
  arena::{
    Allocation,
    Arena,
  },
  classes::{
    classify,
    n_small,
    small_idx,
    tiny_idx,
    SizeClass,
    N_TINY,
  },
  config::{
    PoolConfig,
    PoolResult,
  },
};

/// Attempt and hit counters for one thread's cache of one allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
  pub allocations: u64,
  pub hits: u64,
}

struct CacheBin {
  ring: Ring<Allocation>,
  /// Successful pops since the last trim sweep.
  allocations: usize,
}

impl CacheBin {
  fn new(capacity: usize) -> Self {
    Self {
      ring: Ring::new(capacity),
      allocations: 0,
    }
  }
}

/// Per-thread stash of freed allocations, one bin per cacheable size class.
/// Registered with one arena; entries from other arenas never land here.
struct ThreadCache {
  allocator_id: u64,
  arena: Arc<Arena>,
  tiny: Vec<CacheBin>,
  small: Vec<CacheBin>,
  normal: Vec<CacheBin>,
  max_cached_capacity: usize,
  trim_interval: u64,
  allocations_since_trim: u64,
  stats: CacheStats,
}

impl ThreadCache {
  fn new(allocator_id: u64, arena: Arc<Arena>, config: &PoolConfig) -> Self {
    let page_size = arena.page_size();
    let n_normal = if config.max_cached_capacity >= page_size {
      (config.max_cached_capacity / page_size).ilog2() as usize + 1
    } else {
      0
    };

    Self {
      allocator_id,
      tiny: (0..N_TINY)
        .map(|_| CacheBin::new(config.tiny_cache_size))
        .collect(),
      small: (0..n_small(arena.page_shifts()))
        .map(|_| CacheBin::new(config.small_cache_size))
        .collect(),
      normal: (0..n_normal)
        .map(|_| CacheBin::new(config.normal_cache_size))
        .collect(),
      max_cached_capacity: config.max_cached_capacity,
      trim_interval: config.cache_trim_interval,
      allocations_since_trim: 0,
      stats: CacheStats::default(),
      arena,
    }
  }

  fn bin_mut(&mut self, norm: usize) -> Option<&mut CacheBin> {
    match classify(norm, self.arena.page_size(), self.arena.chunk_size()) {
      SizeClass::Tiny => self.tiny.get_mut(tiny_idx(norm)),
      SizeClass::Small => self.small.get_mut(small_idx(norm)),
      SizeClass::Normal if norm <= self.max_cached_capacity => {
        let idx = (norm >> self.arena.page_shifts()).ilog2() as usize;
        self.normal.get_mut(idx)
      }
      _ => None,
    }
  }

  fn allocate(&mut self, norm: usize) -> Option<Allocation> {
    let bin = self.bin_mut(norm)?;

    let hit = bin.ring.pop();
    if hit.is_some() {
      bin.allocations += 1;
      self.stats.hits += 1;
    }
    self.stats.allocations += 1;

    self.allocations_since_trim += 1;
    if self.allocations_since_trim >= self.trim_interval {
      self.allocations_since_trim = 0;
      self.trim();
    }
    hit
  }

  /// Stashes a freed allocation, handing it back when its class is not
  /// cacheable or the bin is full.
  fn add(&mut self, allocation: Allocation) -> Option<Allocation> {
    let Some(bin) = self.bin_mut(allocation.norm) else {
      return Some(allocation);
    };
    match bin.ring.push(allocation) {
      Ok(()) => None,
      Err(pagepool_ring::RingError::Full(rejected)) => Some(rejected),
    }
  }

  /// Drains bins back to the arena in proportion to how little they were
  /// used since the last sweep, so idle classes do not pin memory.
  fn trim(&mut self) {
    let mut released = 0usize;
    for bin in self
      .tiny
      .iter_mut()
      .chain(self.small.iter_mut())
      .chain(self.normal.iter_mut())
    {
      let free = bin.ring.capacity().saturating_sub(bin.allocations);
      bin.allocations = 0;
      for _ in 0..free {
        match bin.ring.pop() {
          Some(entry) => {
            self.arena.free(entry);
            released += 1;
          }
          None => break,
        }
      }
    }
    if released > 0 {
      log::debug!("thread cache trim released {released} cached allocations");
    }
  }

  fn drain(&mut self) {
    for bin in self
      .tiny
      .iter_mut()
      .chain(self.small.iter_mut())
      .chain(self.normal.iter_mut())
    {
      while let Some(entry) = bin.ring.pop() {
        self.arena.free(entry);
      }
      bin.allocations = 0;
    }
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    self.drain();
    self.arena.unregister_cache();
  }
}

thread_local! {
  static CACHES: RefCell<Vec<ThreadCache>> = const { RefCell::new(Vec::new()) };
}

fn least_loaded(arenas: &[Arc<Arena>]) -> &Arc<Arena> {
  arenas
    .iter()
    .min_by_key(|arena| arena.num_thread_caches())
    .expect("an allocator always has at least one arena")
}

/// Allocates `norm` bytes for the given allocator on the calling thread,
/// going through the thread cache when possible. The first call per thread
/// and allocator registers a cache with the least-loaded arena.
pub(crate) fn allocate_for(
  allocator_id: u64,
  arenas: &[Arc<Arena>],
  config: &PoolConfig,
  norm: usize,
) -> PoolResult<(Arc<Arena>, Allocation)> {
  let cached = CACHES.try_with(|caches| {
    let mut caches = caches.borrow_mut();
    let cache = match caches
      .iter_mut()
      .position(|cache| cache.allocator_id == allocator_id)
    {
      Some(at) => &mut caches[at],
      None => {
        let arena = least_loaded(arenas).clone();
        arena.register_cache();
        log::debug!(
          "thread cache registered with arena holding {} caches",
          arena.num_thread_caches()
        );
        caches.push(ThreadCache::new(allocator_id, arena, config));
        caches.last_mut().expect("just pushed")
      }
    };
    (cache.arena.clone(), cache.allocate(norm))
  });

  match cached {
    Ok((arena, Some(allocation))) => Ok((arena, allocation)),
    Ok((arena, None)) => {
      let allocation = arena.allocate(norm)?;
      Ok((arena, allocation))
    }
    // thread-local storage is gone during teardown, skip the cache
    Err(_) => {
      let arena = least_loaded(arenas).clone();
      let allocation = arena.allocate(norm)?;
      Ok((arena, allocation))
    }
  }
}

/// Cache-aware allocation on a known arena, used when an existing buffer
/// resizes. Falls back to the arena when the calling thread has no cache
/// registered there.
pub(crate) fn allocate_on(arena: &Arc<Arena>, norm: usize) -> PoolResult<Allocation> {
  let cached = CACHES
    .try_with(|caches| {
      caches
        .borrow_mut()
        .iter_mut()
        .find(|cache| Arc::ptr_eq(&cache.arena, arena))
        .and_then(|cache| cache.allocate(norm))
    })
    .ok()
    .flatten();

  match cached {
    Some(allocation) => Ok(allocation),
    None => arena.allocate(norm),
  }
}

/// Returns a freed allocation to the calling thread's cache when it is
/// registered with the owning arena, otherwise straight to the arena.
pub(crate) fn free_allocation(arena: &Arc<Arena>, allocation: Allocation) {
  let mut pending = Some(allocation);

  let _ = CACHES.try_with(|caches| {
    let mut caches = caches.borrow_mut();
    if let Some(cache) = caches
      .iter_mut()
      .find(|cache| Arc::ptr_eq(&cache.arena, arena))
    {
      if let Some(allocation) = pending.take() {
        pending = cache.add(allocation);
      }
    }
  });

  if let Some(allocation) = pending {
    arena.free(allocation);
  }
}

/// Cache counters of the calling thread for one allocator.
pub(crate) fn stats_for(allocator_id: u64) -> Option<CacheStats> {
  CACHES
    .try_with(|caches| {
      caches
        .borrow()
        .iter()
        .find(|cache| cache.allocator_id == allocator_id)
        .map(|cache| cache.stats)
    })
    .ok()
    .flatten()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classes::normalize_capacity;

  fn pool(id: u64) -> (u64, Vec<Arc<Arena>>, PoolConfig) {
    let config = PoolConfig {
      page_size: 4096,
      max_order: 4,
      n_arenas: 2,
      max_cached_capacity: 8192,
      ..PoolConfig::default()
    };
    let arenas = (0..config.n_arenas)
      .map(|_| Arc::new(Arena::new(&config)))
      .collect();
    (id, arenas, config)
  }

  #[test]
  fn test_free_then_allocate_hits_cache() {
    let (id, arenas, config) = pool(1);
    let norm = normalize_capacity(100, config.chunk_size());

    let (arena, first) = allocate_for(id, &arenas, &config, norm).unwrap();
    let ptr = first.ptr;
    free_allocation(&arena, first);

    let (_, second) = allocate_for(id, &arenas, &config, norm).unwrap();
    assert_eq!(second.ptr, ptr);

    let stats = stats_for(id).unwrap();
    assert_eq!(stats.allocations, 2);
    assert_eq!(stats.hits, 1);

    free_allocation(&arena, second);
  }

  #[test]
  fn test_cache_registers_with_least_loaded_arena() {
    let (id, arenas, config) = pool(2);

    let (arena, allocation) = allocate_for(id, &arenas, &config, 16).unwrap();
    assert_eq!(
      arenas.iter().map(|a| a.num_thread_caches()).sum::<usize>(),
      1
    );
    free_allocation(&arena, allocation);
  }

  #[test]
  fn test_foreign_arena_free_bypasses_cache() {
    let (id, arenas, config) = pool(3);
    let norm = 64;

    // bind this thread's cache to one arena
    let (arena, a) = allocate_for(id, &arenas, &config, norm).unwrap();
    free_allocation(&arena, a);

    let other = arenas
      .iter()
      .find(|candidate| !Arc::ptr_eq(candidate, &arena))
      .unwrap();
    let direct = other.allocate(norm).unwrap();
    free_allocation(other, direct);

    // went straight back to its arena, not into this thread's cache
    assert_eq!(other.metrics().deallocations, 1);
  }

  #[test]
  fn test_huge_is_never_cached() {
    let (id, arenas, config) = pool(4);
    let huge = 2 * config.chunk_size();

    let (arena, allocation) = allocate_for(id, &arenas, &config, huge).unwrap();
    free_allocation(&arena, allocation);
    assert_eq!(arena.metrics().deallocations, 1);
    // the attempt never touched a cache bin
    assert_eq!(stats_for(id).unwrap().allocations, 0);
  }

  #[test]
  fn test_trim_releases_idle_entries() {
    let config = PoolConfig {
      page_size: 4096,
      max_order: 4,
      tiny_cache_size: 4,
      cache_trim_interval: 2,
      ..PoolConfig::default()
    };
    let arena = Arc::new(Arena::new(&config));
    arena.register_cache();
    let mut cache = ThreadCache::new(99, arena.clone(), &config);

    // park two tiny entries, then make two unrelated attempts to cross the
    // trim threshold with the tiny bin idle
    for _ in 0..2 {
      let allocation = arena.allocate(32).unwrap();
      assert!(cache.add(allocation).is_none());
    }
    assert!(cache.allocate(256).is_none());
    assert!(cache.allocate(256).is_none());

    // the idle bin was swept back to the arena
    assert_eq!(arena.metrics().deallocations, 2);
    assert!(cache.allocate(32).is_none());
  }
}
