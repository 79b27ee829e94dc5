use core::fmt;
use std::thread;

use pagepool_sys::{
  extent::ExtentError,
  prim::is_page_aligned,
  system::SysError,
};

use crate::chunk::ChunkError;

#[derive(Debug)]
pub enum PoolError {
  InvalidConfig(&'static str),
  InvalidCapacity { requested: usize, maximum: usize },
  System(SysError),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl fmt::Display for PoolError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::InvalidConfig(reason) => write!(f, "invalid pool configuration: {reason}"),
      Self::InvalidCapacity { requested, maximum } => {
        write!(f, "invalid capacity {requested} (maximum {maximum})")
      }
      Self::System(err) => write!(f, "system memory error: {err:?}"),
    }
  }
}

impl std::error::Error for PoolError {}

impl From<ExtentError> for PoolError {
  fn from(err: ExtentError) -> Self {
    match err {
      ExtentError::SystemError(sys) => Self::System(sys),
      ExtentError::OutOfBounds => Self::System(SysError::InvalidArgument),
    }
  }
}

impl From<ChunkError> for PoolError {
  fn from(err: ChunkError) -> Self {
    match err {
      ChunkError::Extent(extent) => extent.into(),
      ChunkError::Prim(_) => Self::System(SysError::InvalidArgument),
    }
  }
}

/// Pool geometry and thread-cache sizing, validated once at construction.
/// There is no process-wide mutable configuration; every allocator carries
/// its own copy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Pool page size in bytes. Power of two, at least [`Self::MIN_PAGE_SIZE`].
  pub page_size: usize,
  /// Depth of the buddy tree per chunk: a chunk spans
  /// `page_size << max_order` bytes.
  pub max_order: u32,
  /// Number of arenas to spread thread caches across.
  pub n_arenas: usize,
  /// Thread-cache queue depth for sub-512-byte classes.
  pub tiny_cache_size: usize,
  /// Thread-cache queue depth for classes between 512 bytes and a page.
  pub small_cache_size: usize,
  /// Thread-cache queue depth for whole-page-run classes.
  pub normal_cache_size: usize,
  /// Largest normalized capacity the thread cache will hold on to.
  pub max_cached_capacity: usize,
  /// Cache allocations between trim sweeps.
  pub cache_trim_interval: u64,
}

impl PoolConfig {
  pub const MIN_PAGE_SIZE: usize = 4096;
  pub const MAX_ORDER_LIMIT: u32 = 14;

  pub fn chunk_size(&self) -> usize {
    self.page_size << self.max_order
  }

  pub fn page_shifts(&self) -> u32 {
    self.page_size.trailing_zeros()
  }

  pub fn validate(&self) -> PoolResult<()> {
    if !self.page_size.is_power_of_two() || self.page_size < Self::MIN_PAGE_SIZE {
      return Err(PoolError::InvalidConfig(
        "page_size must be a power of two of at least 4096",
      ));
    }
    if self.max_order == 0 || self.max_order > Self::MAX_ORDER_LIMIT {
      return Err(PoolError::InvalidConfig("max_order must be in 1..=14"));
    }
    // chunks are mapped directly, so they must land on system page boundaries
    if !matches!(is_page_aligned(self.chunk_size()), Ok(true)) {
      return Err(PoolError::InvalidConfig(
        "chunk size is not a multiple of the system page size",
      ));
    }
    if self.n_arenas == 0 {
      return Err(PoolError::InvalidConfig("n_arenas must be at least 1"));
    }
    if self.max_cached_capacity > self.chunk_size() {
      return Err(PoolError::InvalidConfig(
        "max_cached_capacity cannot exceed the chunk size",
      ));
    }
    if self.cache_trim_interval == 0 {
      return Err(PoolError::InvalidConfig(
        "cache_trim_interval must be at least 1",
      ));
    }
    Ok(())
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      page_size: 8192,
      max_order: 11,
      n_arenas: thread::available_parallelism().map_or(1, |n| n.get()),
      tiny_cache_size: 512,
      small_cache_size: 256,
      normal_cache_size: 64,
      max_cached_capacity: 32 * 1024,
      cache_trim_interval: 8192,
    }
  }
}
