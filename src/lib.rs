//! Facade over the pool workspace. Everything lives in the member crates;
//! this re-exports the allocator surface under one name.

pub use pagepool_alloc::{
  normalize_capacity,
  ArenaMetrics,
  BufError,
  BufResult,
  CacheStats,
  PoolConfig,
  PoolError,
  PoolResult,
  PooledAllocator,
  PooledBuf,
  SizeClass,
};

pub mod prelude {
  pub use pagepool_alloc::{
    PoolConfig,
    PoolError,
    PoolResult,
    PooledAllocator,
    PooledBuf,
  };
}
