use getset::CopyGetters;
use pagepool_bitmap::Bitmap;
use pagepool_list::{
  Key,
  Link,
  Linked,
};

/// One pool page sliced into equal elements of a tiny or small size class.
/// Which slots are handed out is tracked by a bitmap; the owning arena keeps
/// partially filled subpages of each class on a pool ring so the next
/// allocation of that class reuses them.
#[derive(CopyGetters)]
pub struct Subpage {
  /// Chunk the backing page was carved from.
  #[getset(get_copy = "pub")]
  chunk: Key,
  /// Buddy leaf node of the backing page.
  #[getset(get_copy = "pub")]
  node: u32,
  #[getset(get_copy = "pub")]
  elem_size: usize,
  #[getset(get_copy = "pub")]
  max_elems: usize,
  bitmap: Bitmap,
  /// Where the next probe starts. Freed slots park their index here.
  next_avail: usize,
  /// Whether the subpage currently sits on its class pool ring.
  #[getset(get_copy = "pub")]
  in_pool: bool,
  link: Link,
}

impl Subpage {
  pub fn new(chunk: Key, node: u32, page_size: usize, elem_size: usize) -> Self {
    let max_elems = page_size / elem_size;
    Self {
      chunk,
      node,
      elem_size,
      max_elems,
      bitmap: Bitmap::zero(max_elems),
      next_avail: 0,
      in_pool: false,
      link: Link::default(),
    }
  }

  pub fn set_in_pool(&mut self, in_pool: bool) {
    self.in_pool = in_pool;
  }

  pub fn used(&self) -> usize {
    self.bitmap.used()
  }

  pub fn is_full(&self) -> bool {
    self.bitmap.is_full()
  }

  pub fn is_empty(&self) -> bool {
    self.bitmap.is_clear()
  }

  /// Claims a free slot, probing from the last freed index first.
  pub fn allocate(&mut self) -> Option<u32> {
    let idx = self.bitmap.find_clear_from(self.next_avail)?;
    self
      .bitmap
      .set(idx)
      .expect("found index is within the bitmap");
    self.next_avail = idx + 1;
    Some(idx as u32)
  }

  /// Releases a slot and parks it as the next probe hint. Freeing a slot
  /// that is not allocated is a bookkeeping bug upstream.
  pub fn free(&mut self, idx: u32) {
    let idx = idx as usize;
    debug_assert!(matches!(self.bitmap.get(idx), Ok(true)), "double free of subpage slot");
    self
      .bitmap
      .clear(idx)
      .expect("freed index is within the bitmap");
    self.next_avail = idx;
  }
}

impl Linked for Subpage {
  fn link(&self) -> &Link {
    &self.link
  }

  fn link_mut(&mut self) -> &mut Link {
    &mut self.link
  }
}
