//! Deterministic gateway for unit tests.

use core::ptr::NonNull;

use crate::{
  PAGE_SIZE,
  os::{MmapPages, PageSource},
  page::Page,
};

/// Hands out pages from one pre-mapped region in address order, leaving
/// `gap` unused pages after every acquisition. Runs dry after `capacity`
/// pages, which is how tests simulate out-of-memory.
pub(crate) struct TestPages {
  base: NonNull<u8>,
  capacity: usize,
  cursor: usize,
  gap: usize,
  pub(crate) calls: usize,
  pub(crate) pages: usize,
}

impl TestPages {
  pub(crate) fn new(capacity: usize) -> Self {
    Self::with_gap(capacity, 0)
  }

  pub(crate) fn with_gap(capacity: usize, gap: usize) -> Self {
    let base = MmapPages.acquire_pages(capacity).expect("mmap failed");
    Self {
      base,
      capacity,
      cursor: 0,
      gap,
      calls: 0,
      pages: 0,
    }
  }

  /// The next single page as a descriptor.
  pub(crate) fn page(&mut self) -> Page {
    let base = self.acquire_pages(1).expect("test region exhausted");
    unsafe { Page::from_base(base) }
  }

  /// Address of page `index` of the region.
  pub(crate) fn addr(&self, index: usize) -> usize {
    self.base.as_ptr() as usize + index * PAGE_SIZE
  }
}

unsafe impl PageSource for TestPages {
  fn acquire_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
    if count == 0 || self.cursor + count > self.capacity {
      return None;
    }
    let region = unsafe { self.base.byte_add(self.cursor * PAGE_SIZE) };
    self.cursor += count + self.gap;
    self.calls += 1;
    self.pages += count;
    Some(region)
  }
}
