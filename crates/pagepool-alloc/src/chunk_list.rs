use pagepool_list::{
  Key,
  ListHead,
  Slab,
};

use crate::chunk::Chunk;

pub const QINIT: usize = 0;
pub const Q000: usize = 1;
pub const Q025: usize = 2;
pub const Q050: usize = 3;
pub const Q075: usize = 4;
pub const Q100: usize = 5;
pub const N_BUCKETS: usize = 6;

/// Bucket probe order on the allocation path. Mid-utilization chunks go
/// first so they fill up and retire, fresh chunks absorb demand next, and
/// the nearly-full bucket is the last resort.
pub const ALLOC_ORDER: [usize; 5] = [Q050, Q025, Q000, QINIT, Q075];

struct Bucket {
  min_usage: i32,
  max_usage: i32,
  next: Option<usize>,
  prev: Option<usize>,
  chunks: ListHead,
}

impl Bucket {
  const fn new(min_usage: i32, max_usage: i32, next: Option<usize>, prev: Option<usize>) -> Self {
    Self {
      min_usage,
      max_usage,
      next,
      prev,
      chunks: ListHead::new(),
    }
  }
}

/// Chunks bucketed by utilization. Buckets overlap so a chunk hovering at a
/// boundary does not ping-pong between lists on every allocate/free pair.
///
/// `qinit` holds fresh and fully drained chunks and never evicts downward,
/// so an arena's pooled chunks survive idle periods. A chunk that drains
/// while in `q000` falls off the bottom instead and is handed back to the
/// caller for destruction.
pub struct ChunkLists {
  buckets: [Bucket; N_BUCKETS],
}

impl ChunkLists {
  pub fn new() -> Self {
    Self {
      buckets: [
        Bucket::new(i32::MIN, 25, Some(Q000), Some(QINIT)),
        Bucket::new(1, 50, Some(Q025), None),
        Bucket::new(25, 75, Some(Q050), Some(Q000)),
        Bucket::new(50, 100, Some(Q075), Some(Q025)),
        Bucket::new(75, 100, Some(Q100), Some(Q050)),
        Bucket::new(100, i32::MAX, None, Some(Q075)),
      ],
    }
  }

  pub fn front(&self, bucket: usize) -> Option<Key> {
    self.buckets[bucket].chunks.front()
  }

  pub fn len(&self, bucket: usize) -> usize {
    self.buckets[bucket].chunks.len()
  }

  fn link(&mut self, chunks: &mut Slab<Chunk>, key: Key, bucket: usize) {
    chunks
      .get_mut(key)
      .expect("link of vacant chunk key")
      .set_bucket(bucket);
    self.buckets[bucket].chunks.push_front(chunks, key);
  }

  /// Files a chunk that is not on any list yet, cascading forward from
  /// `qinit` until a bucket accepts its usage.
  pub fn insert(&mut self, chunks: &mut Slab<Chunk>, key: Key) {
    let usage = chunks.get(key).expect("insert of vacant chunk key").usage();

    let mut bucket = QINIT;
    while usage >= self.buckets[bucket].max_usage {
      bucket = self.buckets[bucket].next.expect("top bucket has no ceiling");
    }
    self.link(chunks, key, bucket);
  }

  /// Moves a chunk toward fuller buckets after an allocation raised its
  /// usage.
  pub fn migrate_up(&mut self, chunks: &mut Slab<Chunk>, key: Key) {
    let chunk = chunks.get(key).expect("migrate of vacant chunk key");
    let usage = chunk.usage();
    let mut bucket = chunk.bucket();

    if usage < self.buckets[bucket].max_usage {
      return;
    }

    self.buckets[bucket].chunks.remove(chunks, key);
    while usage >= self.buckets[bucket].max_usage {
      bucket = self.buckets[bucket].next.expect("top bucket has no ceiling");
    }
    self.link(chunks, key, bucket);
  }

  /// Moves a chunk toward emptier buckets after a free lowered its usage.
  /// Returns `false` when the chunk fell off the bottom of `q000`; it is
  /// then unlinked and the caller decides whether to retain or destroy it.
  pub fn migrate_down(&mut self, chunks: &mut Slab<Chunk>, key: Key) -> bool {
    let chunk = chunks.get(key).expect("migrate of vacant chunk key");
    let usage = chunk.usage();
    let mut bucket = chunk.bucket();

    if usage >= self.buckets[bucket].min_usage {
      return true;
    }

    self.buckets[bucket].chunks.remove(chunks, key);
    while usage < self.buckets[bucket].min_usage {
      match self.buckets[bucket].prev {
        Some(prev) if prev != bucket => bucket = prev,
        Some(_) => break,
        None => return false,
      }
    }
    self.link(chunks, key, bucket);
    true
  }
}

impl Default for ChunkLists {
  fn default() -> Self {
    Self::new()
  }
}
