use core::ptr::NonNull;

use getset::CopyGetters;
use pagepool_list::{
  Key,
  Link,
  Linked,
};
use pagepool_sys::{
  extent::{
    Extent,
    ExtentError,
  },
  prim::{
    page_align,
    PrimError,
  },
};

#[derive(Debug)]
pub enum ChunkError {
  Extent(ExtentError),
  Prim(PrimError),
}

pub type ChunkResult<T> = Result<T, ChunkError>;

impl From<ExtentError> for ChunkError {
  fn from(err: ExtentError) -> Self {
    Self::Extent(err)
  }
}

impl From<PrimError> for ChunkError {
  fn from(err: PrimError) -> Self {
    Self::Prim(err)
  }
}

/// Where an allocation lives inside its chunk. A `Run` covers whole pages
/// rooted at a buddy-tree node; an `Elem` is one slot of the subpage that
/// owns the node's page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handle {
  Run { node: u32 },
  Elem { node: u32, bitmap_idx: u32 },
}

impl Handle {
  pub const fn node(self) -> u32 {
    match self {
      Self::Run { node } | Self::Elem { node, .. } => node,
    }
  }
}

/// A mapped region carved up by a binary buddy tree.
///
/// The tree is stored as one depth byte per node: `state[id]` is the
/// shallowest depth at which a run is still available under `id`. A node
/// starts at its own depth and is bumped to `max_order + 1` when the run it
/// roots is handed out. Node 1 is the root; the leaves sit at depth
/// `max_order`, one per pool page.
#[derive(CopyGetters)]
pub struct Chunk {
  extent: Extent,
  state_map: Vec<u8>,
  subpages: Vec<Option<Key>>,
  #[getset(get_copy = "pub")]
  page_size: usize,
  #[getset(get_copy = "pub")]
  page_shifts: u32,
  #[getset(get_copy = "pub")]
  max_order: u32,
  #[getset(get_copy = "pub")]
  chunk_size: usize,
  #[getset(get_copy = "pub")]
  free_bytes: usize,
  #[getset(get_copy = "pub")]
  bucket: usize,
  link: Link,
  unpooled: bool,
}

impl Chunk {
  pub fn new(page_size: usize, max_order: u32) -> ChunkResult<Self> {
    let chunk_size = page_size << max_order;
    let extent = Extent::new(chunk_size)?;

    let n_nodes = 1usize << (max_order + 1);
    let mut state_map = vec![0u8; n_nodes];
    for id in 1..n_nodes {
      state_map[id] = id.ilog2() as u8;
    }

    log::debug!("mapped pooled chunk of {chunk_size} bytes");

    Ok(Self {
      extent,
      state_map,
      subpages: vec![None; 1 << max_order],
      page_size,
      page_shifts: page_size.trailing_zeros(),
      max_order,
      chunk_size,
      free_bytes: chunk_size,
      bucket: 0,
      link: Link::default(),
      unpooled: false,
    })
  }

  /// Maps a dedicated region for one oversized allocation. No buddy tree,
  /// no reuse; the mapping is released when the allocation is freed.
  pub fn new_unpooled(size: usize) -> ChunkResult<Self> {
    let mapped = page_align(size)?;
    let extent = Extent::new(mapped)?;

    log::debug!("mapped unpooled chunk of {mapped} bytes for {size} byte request");

    Ok(Self {
      extent,
      state_map: Vec::new(),
      subpages: Vec::new(),
      page_size: mapped,
      page_shifts: 0,
      max_order: 0,
      chunk_size: mapped,
      free_bytes: 0,
      bucket: 0,
      link: Link::default(),
      unpooled: true,
    })
  }

  pub fn is_unpooled(&self) -> bool {
    self.unpooled
  }

  pub fn mapped_len(&self) -> usize {
    self.extent.len()
  }

  pub fn base(&self) -> NonNull<u8> {
    self.extent.base()
  }

  pub fn set_bucket(&mut self, bucket: usize) {
    self.bucket = bucket;
  }

  pub fn is_idle(&self) -> bool {
    self.free_bytes == self.chunk_size
  }

  /// Percentage of the chunk handed out. Never reports 100 while any byte
  /// is free, and never 0 once the free remainder rounds down to nothing.
  pub fn usage(&self) -> i32 {
    if self.free_bytes == 0 {
      return 100;
    }
    let free_pct = (self.free_bytes * 100 / self.chunk_size) as i32;
    if free_pct == 0 {
      return 99;
    }
    100 - free_pct
  }

  fn state(&self, id: usize) -> u8 {
    self.state_map[id]
  }

  const fn unusable(&self) -> u8 {
    (self.max_order + 1) as u8
  }

  /// Finds a free node at exactly depth `d`, marks it taken, and fixes up
  /// every ancestor. Walks down from the root, preferring the left child
  /// and falling over to the sibling when the left subtree cannot satisfy
  /// the depth.
  fn allocate_node(&mut self, d: u32) -> Option<u32> {
    let d = d as u8;
    if self.state(1) > d {
      return None;
    }

    let mut id = 1usize;
    while self.state(id) < d || id < (1usize << d) {
      id <<= 1;
      if self.state(id) > d {
        id ^= 1;
      }
    }

    self.state_map[id] = self.unusable();
    self.update_parents_alloc(id);
    Some(id as u32)
  }

  fn update_parents_alloc(&mut self, mut id: usize) {
    while id > 1 {
      let parent = id >> 1;
      let val1 = self.state(id);
      let val2 = self.state(id ^ 1);
      self.state_map[parent] = val1.min(val2);
      id = parent;
    }
  }

  /// Walks freed state up the tree. When both children of a parent are
  /// fully free the parent becomes fully free too, re-forming the larger
  /// run; otherwise it tracks the shallower of the two.
  fn update_parents_free(&mut self, mut id: usize) {
    let mut log_child = id.ilog2() as u8 + 1;
    while id > 1 {
      let parent = id >> 1;
      let val1 = self.state(id);
      let val2 = self.state(id ^ 1);
      log_child -= 1;

      if val1 == log_child && val2 == log_child {
        self.state_map[parent] = log_child - 1;
      } else {
        self.state_map[parent] = val1.min(val2);
      }
      id = parent;
    }
  }

  /// Reserves a run of pages covering `norm` bytes. `norm` must be a
  /// power-of-two multiple of the page size no larger than the chunk.
  pub fn allocate_run(&mut self, norm: usize) -> Option<u32> {
    let d = self.max_order - (norm >> self.page_shifts).ilog2();
    let node = self.allocate_node(d)?;
    self.free_bytes -= self.run_length(node);
    Some(node)
  }

  /// Reserves a single leaf page, the unit a subpage is built on.
  pub fn allocate_page(&mut self) -> Option<u32> {
    let node = self.allocate_node(self.max_order)?;
    self.free_bytes -= self.page_size;
    Some(node)
  }

  pub fn free_run(&mut self, node: u32) {
    let id = node as usize;
    self.free_bytes += self.run_length(node);
    self.state_map[id] = id.ilog2() as u8;
    self.update_parents_free(id);
  }

  pub fn run_length(&self, node: u32) -> usize {
    self.chunk_size >> node.ilog2()
  }

  pub fn run_offset(&self, node: u32) -> usize {
    let depth = node.ilog2();
    let shift = (node ^ (1 << depth)) as usize;
    shift * self.run_length(node)
  }

  /// Byte offset of an allocation from the chunk base.
  pub fn offset_of(&self, handle: Handle, elem_size: usize) -> usize {
    match handle {
      Handle::Run { node } => self.run_offset(node),
      Handle::Elem { node, bitmap_idx } => {
        self.run_offset(node) + bitmap_idx as usize * elem_size
      }
    }
  }

  pub fn leaf_index(&self, node: u32) -> usize {
    (node ^ (1 << self.max_order)) as usize
  }

  pub fn subpage_at(&self, node: u32) -> Option<Key> {
    self.subpages[self.leaf_index(node)]
  }

  pub fn set_subpage(&mut self, node: u32, subpage: Option<Key>) {
    let leaf = self.leaf_index(node);
    self.subpages[leaf] = subpage;
  }

  /// Returns the chunk's pages to the kernel while keeping the mapping.
  /// Only valid on an idle chunk; the buddy tree is already back in its
  /// initial state by then.
  pub fn reclaim(&mut self) -> ChunkResult<()> {
    debug_assert!(self.is_idle());
    self.extent.reclaim().map_err(ChunkError::Extent)
  }
}

impl Linked for Chunk {
  fn link(&self) -> &Link {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link {
    &mut self.link
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE: usize = 4096;
  const ORDER: u32 = 4;
  const CHUNK: usize = PAGE << ORDER;

  fn chunk() -> Chunk {
    Chunk::new(PAGE, ORDER).unwrap()
  }

  #[test]
  fn test_new_chunk_is_idle() {
    let c = chunk();
    assert!(c.is_idle());
    assert_eq!(c.free_bytes(), CHUNK);
    assert_eq!(c.usage(), 0);
    assert_eq!(c.mapped_len(), CHUNK);
    assert!(!c.is_unpooled());
  }

  #[test]
  fn test_allocate_all_pages() {
    let mut c = chunk();
    let mut offsets = Vec::new();

    for _ in 0..(1 << ORDER) {
      let node = c.allocate_page().unwrap();
      offsets.push(c.run_offset(node));
    }
    assert!(c.allocate_page().is_none());
    assert_eq!(c.usage(), 100);

    offsets.sort_unstable();
    let expect: Vec<usize> = (0..(1 << ORDER)).map(|i| i * PAGE).collect();
    assert_eq!(offsets, expect);
  }

  #[test]
  fn test_allocate_run_geometry() {
    let mut c = chunk();

    let node = c.allocate_run(2 * PAGE).unwrap();
    assert_eq!(c.run_length(node), 2 * PAGE);
    assert_eq!(c.run_offset(node) % (2 * PAGE), 0);
    assert_eq!(c.free_bytes(), CHUNK - 2 * PAGE);

    let whole = c.allocate_run(CHUNK);
    assert!(whole.is_none());

    c.free_run(node);
    assert!(c.is_idle());
    let whole = c.allocate_run(CHUNK).unwrap();
    assert_eq!(whole, 1);
    assert_eq!(c.run_offset(whole), 0);
  }

  #[test]
  fn test_buddies_coalesce() {
    let mut c = chunk();

    let a = c.allocate_page().unwrap();
    let b = c.allocate_page().unwrap();
    assert_eq!(b, a ^ 1, "first two pages are siblings");

    // while the pair is split, their parent cannot host a 2-page run at
    // offset 0
    let run = c.allocate_run(2 * PAGE).unwrap();
    assert_ne!(c.run_offset(run), 0);

    c.free_run(a);
    c.free_run(b);
    let reformed = c.allocate_run(2 * PAGE).unwrap();
    assert_eq!(c.run_offset(reformed), 0);
  }

  #[test]
  fn test_free_reuses_offset() {
    let mut c = chunk();

    let node = c.allocate_page().unwrap();
    let offset = c.run_offset(node);
    c.free_run(node);

    let again = c.allocate_page().unwrap();
    assert_eq!(c.run_offset(again), offset);
  }

  #[test]
  fn test_usage_rounds_inward() {
    let mut c = chunk();
    assert_eq!(c.usage(), 0);

    let node = c.allocate_page().unwrap();
    let used = c.usage();
    assert!(used > 0 && used < 100);

    let rest = c.allocate_run(CHUNK / 2).unwrap();
    let more = c.usage();
    assert!(more > used && more < 100);

    c.free_run(rest);
    c.free_run(node);
    assert_eq!(c.usage(), 0);
  }

  #[test]
  fn test_offset_of_elem() {
    let mut c = chunk();
    let node = c.allocate_page().unwrap();

    let run = Handle::Run { node };
    let base = c.offset_of(run, 0);
    assert_eq!(base, c.run_offset(node));

    let elem = Handle::Elem {
      node,
      bitmap_idx: 3,
    };
    assert_eq!(c.offset_of(elem, 64), base + 3 * 64);
    assert_eq!(elem.node(), node);
  }

  #[test]
  fn test_subpage_slots() {
    let mut c = chunk();
    let node = c.allocate_page().unwrap();

    assert_eq!(c.subpage_at(node), None);
    c.set_subpage(node, Some(7));
    assert_eq!(c.subpage_at(node), Some(7));
    c.set_subpage(node, None);
    assert_eq!(c.subpage_at(node), None);
  }

  #[test]
  fn test_unpooled_rounds_to_page() {
    let c = Chunk::new_unpooled(100_000).unwrap();
    assert!(c.is_unpooled());
    assert!(c.mapped_len() >= 100_000);
    assert_eq!(c.mapped_len() % pagepool_sys::prim::page_size(), 0);
  }

  #[test]
  fn test_reclaim_keeps_mapping_usable() {
    let mut c = chunk();
    let node = c.allocate_page().unwrap();
    c.free_run(node);

    c.reclaim().unwrap();

    let node = c.allocate_page().unwrap();
    let offset = c.run_offset(node);
    unsafe {
      let p = c.base().as_ptr().add(offset);
      p.write(0xAB);
      assert_eq!(p.read(), 0xAB);
    }
  }
}
