use std::cell::RefCell;

use crate::buf::BufCore;

/// Retired buffer shells kept per thread. Handing out a warm shell skips the
/// heap allocation on the buffer hot path.
const MAX_POOLED: usize = 256;

thread_local! {
  static SHELLS: RefCell<Vec<Box<BufCore>>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn acquire() -> Option<Box<BufCore>> {
  SHELLS
    .try_with(|shells| shells.borrow_mut().pop())
    .ok()
    .flatten()
}

pub(crate) fn recycle(core: Box<BufCore>) {
  debug_assert!(core.is_region_empty(), "recycled shell still owns memory");

  // during thread teardown the pool may be gone, the shell just drops
  let _ = SHELLS.try_with(|shells| {
    let mut shells = shells.borrow_mut();
    if shells.len() < MAX_POOLED {
      shells.push(core);
    }
  });
}
