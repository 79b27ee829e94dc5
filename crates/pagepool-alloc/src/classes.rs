use pagepool_sys::math::align_up;

/// Step between sub-512-byte size classes.
pub const QUANTUM: usize = 16;
/// Below this, capacities round to the quantum; from here up, to powers of
/// two.
pub const SMALL_THRESHOLD: usize = 512;
/// Tiny pool heads, one per quantum step. Index 0 stays unused because the
/// smallest normalized capacity is one quantum.
pub const N_TINY: usize = SMALL_THRESHOLD / QUANTUM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
  Tiny,
  Small,
  Normal,
  Huge,
}

/// Rounds a requested capacity up to its size class.
///
/// Requests of a full chunk or more pass through untouched and go to
/// dedicated mappings. Everything from 512 bytes up rounds to the next power
/// of two; below that, to the next quantum multiple. Idempotent.
pub fn normalize_capacity(req: usize, chunk_size: usize) -> usize {
  if req >= chunk_size {
    return req;
  }
  if req >= SMALL_THRESHOLD {
    return req.next_power_of_two();
  }
  if req == 0 {
    return QUANTUM;
  }
  align_up(req, QUANTUM).expect("quantum is a power of two")
}

pub fn classify(norm: usize, page_size: usize, chunk_size: usize) -> SizeClass {
  if norm >= chunk_size {
    SizeClass::Huge
  } else if norm < SMALL_THRESHOLD {
    SizeClass::Tiny
  } else if norm < page_size {
    SizeClass::Small
  } else {
    SizeClass::Normal
  }
}

#[inline]
pub fn tiny_idx(norm: usize) -> usize {
  norm / QUANTUM
}

#[inline]
pub fn small_idx(norm: usize) -> usize {
  (norm.ilog2() - SMALL_THRESHOLD.ilog2()) as usize
}

/// Small pool heads cover powers of two from 512 up to half a page.
pub fn n_small(page_shifts: u32) -> usize {
  (page_shifts - SMALL_THRESHOLD.ilog2()) as usize
}

#[cfg(test)]
mod tests {
  use super::*;

  const PAGE: usize = 8192;
  const CHUNK: usize = PAGE << 11;

  #[test]
  fn test_normalize_tiny() {
    assert_eq!(normalize_capacity(0, CHUNK), 16);
    assert_eq!(normalize_capacity(1, CHUNK), 16);
    assert_eq!(normalize_capacity(16, CHUNK), 16);
    assert_eq!(normalize_capacity(17, CHUNK), 32);
    assert_eq!(normalize_capacity(24, CHUNK), 32);
    assert_eq!(normalize_capacity(496, CHUNK), 496);
    assert_eq!(normalize_capacity(500, CHUNK), 512);
  }

  #[test]
  fn test_normalize_pow2() {
    assert_eq!(normalize_capacity(512, CHUNK), 512);
    assert_eq!(normalize_capacity(513, CHUNK), 1024);
    assert_eq!(normalize_capacity(600, CHUNK), 1024);
    assert_eq!(normalize_capacity(4096, CHUNK), 4096);
    assert_eq!(normalize_capacity(PAGE + 1, CHUNK), PAGE * 2);
  }

  #[test]
  fn test_normalize_huge_passthrough() {
    assert_eq!(normalize_capacity(CHUNK, CHUNK), CHUNK);
    assert_eq!(normalize_capacity(CHUNK + 3, CHUNK), CHUNK + 3);
    assert_eq!(normalize_capacity(20 * 1024 * 1024, CHUNK), 20 * 1024 * 1024);
  }

  #[test]
  fn test_normalize_idempotent() {
    for req in [0, 1, 24, 496, 500, 512, 600, 4096, PAGE, CHUNK - 1, CHUNK + 3] {
      let once = normalize_capacity(req, CHUNK);
      assert_eq!(normalize_capacity(once, CHUNK), once, "req {req}");
    }
  }

  #[test]
  fn test_classify_boundaries() {
    assert_eq!(classify(16, PAGE, CHUNK), SizeClass::Tiny);
    assert_eq!(classify(496, PAGE, CHUNK), SizeClass::Tiny);
    assert_eq!(classify(512, PAGE, CHUNK), SizeClass::Small);
    assert_eq!(classify(PAGE / 2, PAGE, CHUNK), SizeClass::Small);
    assert_eq!(classify(PAGE, PAGE, CHUNK), SizeClass::Normal);
    assert_eq!(classify(CHUNK / 2, PAGE, CHUNK), SizeClass::Normal);
    assert_eq!(classify(CHUNK, PAGE, CHUNK), SizeClass::Huge);
  }

  #[test]
  fn test_pool_indices() {
    assert_eq!(tiny_idx(16), 1);
    assert_eq!(tiny_idx(32), 2);
    assert_eq!(tiny_idx(496), 31);
    assert!(tiny_idx(496) < N_TINY);

    assert_eq!(small_idx(512), 0);
    assert_eq!(small_idx(1024), 1);
    assert_eq!(small_idx(4096), 3);
    assert_eq!(n_small(13), 4);
  }
}
