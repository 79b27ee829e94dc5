#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;

#[derive(Debug, PartialEq, Eq)]
pub enum RingError<T> {
  Full(T),
}

/// Bounded FIFO queue with a capacity fixed at construction. A full ring
/// hands the rejected value back so the caller can route it elsewhere.
pub struct Ring<T> {
  buf: Vec<Option<T>>,
  head: usize,
  tail: usize,
  len: usize,
}

impl<T> Ring<T> {
  pub fn new(capacity: usize) -> Self {
    let mut buf = Vec::with_capacity(capacity);
    buf.resize_with(capacity, || None);
    Self {
      buf,
      head: 0,
      tail: 0,
      len: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.buf.len()
  }

  pub const fn len(&self) -> usize {
    self.len
  }

  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }

  pub fn is_full(&self) -> bool {
    self.len == self.buf.len()
  }

  fn next_idx(&self, current: usize) -> usize {
    (current + 1) % self.buf.len()
  }

  pub fn push(&mut self, val: T) -> Result<(), RingError<T>> {
    if self.is_full() {
      return Err(RingError::Full(val));
    }

    let head = self.head;
    self.buf[head] = Some(val);
    self.head = self.next_idx(head);
    self.len += 1;

    Ok(())
  }

  pub fn pop(&mut self) -> Option<T> {
    if self.is_empty() {
      return None;
    }

    let tail = self.tail;
    let val = self.buf[tail].take();
    self.tail = self.next_idx(tail);
    self.len -= 1;

    val
  }
}
