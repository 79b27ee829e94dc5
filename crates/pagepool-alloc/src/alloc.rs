use std::sync::{
  atomic::{
    AtomicU64,
    Ordering,
  },
  Arc,
};

use spin::Lazy;

use crate::{
  arena::{
    Arena,
    ArenaMetrics,
  },
  buf::PooledBuf,
  classes::normalize_capacity,
  config::{
    PoolConfig,
    PoolError,
    PoolResult,
  },
  tcache::{
    self,
    CacheStats,
  },
};

static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(0);

/// The pool entry point: a validated configuration and a fixed set of
/// arenas. Threads are spread across the arenas through their caches; the
/// allocator itself is cheap to share behind an [`Arc`] or a static.
pub struct PooledAllocator {
  id: u64,
  config: PoolConfig,
  arenas: Vec<Arc<Arena>>,
}

impl PooledAllocator {
  pub fn new(config: PoolConfig) -> PoolResult<Self> {
    config.validate()?;
    let arenas = (0..config.n_arenas)
      .map(|_| Arc::new(Arena::new(&config)))
      .collect();

    let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);
    log::debug!(
      "allocator {id}: {} arenas, {} byte pages, {} byte chunks",
      config.n_arenas,
      config.page_size,
      config.chunk_size()
    );

    Ok(Self { id, config, arenas })
  }

  /// Process-wide allocator with the default configuration.
  pub fn shared() -> &'static PooledAllocator {
    static SHARED: Lazy<PooledAllocator> =
      Lazy::new(|| PooledAllocator::new(PoolConfig::default()).expect("default config is valid"));
    &SHARED
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  /// Hands out a buffer of at least `initial` bytes that may grow to
  /// `max`. The capacity is the normalized request, capped at `max`; a
  /// request of zero with a zero cap yields the empty buffer.
  pub fn buffer(&self, initial: usize, max: usize) -> PoolResult<PooledBuf> {
    if initial > max {
      return Err(PoolError::InvalidCapacity {
        requested: initial,
        maximum: max,
      });
    }
    if max == 0 {
      return Ok(PooledBuf::empty(0));
    }

    let norm = normalize_capacity(initial, self.config.chunk_size());
    let (arena, allocation) = tcache::allocate_for(self.id, &self.arenas, &self.config, norm)?;
    Ok(PooledBuf::from_allocation(arena, allocation, max))
  }

  /// Counter snapshots for every arena, in arena order.
  pub fn metrics(&self) -> Vec<ArenaMetrics> {
    self.arenas.iter().map(|arena| arena.metrics()).collect()
  }

  /// Cache counters of the calling thread, present once it allocated here.
  pub fn cache_stats(&self) -> Option<CacheStats> {
    tcache::stats_for(self.id)
  }
}
