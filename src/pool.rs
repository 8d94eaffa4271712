//! Free pool: empty pages sorted by ascending address.
//!
//! Contiguity is never stored. Runs of adjacent pages are found by scanning
//! for `page.end() == next.addr()`, which only works because every insertion
//! keeps the address order.

use crate::{list::PageList, page::Page};

#[cfg(feature = "log")]
use log::trace;

pub(crate) struct FreePool {
  pages: PageList,
}

impl FreePool {
  pub(crate) const fn new() -> Self {
    Self {
      pages: PageList::new(),
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.pages.len()
  }

  #[cfg(test)]
  pub(crate) fn is_empty(&self) -> bool {
    self.pages.is_empty()
  }

  #[cfg(test)]
  pub(crate) unsafe fn iter(&self) -> crate::list::Iter {
    unsafe { self.pages.iter() }
  }

  /// Insert one empty page at its sorted position.
  #[inline]
  pub(crate) unsafe fn insert_sorted(&mut self, page: Page) {
    unsafe { self.insert_span_sorted(page, 1) };
  }

  /// Reset the `count` contiguous pages starting at `first` to plain pages and
  /// splice them into the pool as one chain. No pool entry can fall inside the
  /// span, so the whole chain shares one insertion point.
  pub(crate) unsafe fn insert_span_sorted(&mut self, first: Page, count: usize) {
    debug_assert!(count >= 1);
    let mut last = first;
    unsafe {
      first.reset_empty();
      for i in 1..count {
        let page = first.add(i);
        page.reset_empty();
        last.set_next(Some(page));
        last = page;
      }
    }

    let mut prev = None;
    let mut cursor = self.pages.head();
    while let Some(page) = cursor {
      debug_assert!(
        page.addr() < first.addr() || page.addr() > last.addr(),
        "page {:#x} already in free pool",
        page.addr()
      );
      if page.addr() > first.addr() {
        break;
      }
      prev = Some(page);
      cursor = unsafe { page.next() };
    }

    unsafe { self.pages.splice_after(prev, first, last, count) };
  }

  /// Take one page for a small size class.
  ///
  /// Prefers a page that is adjacent to neither neighbour, so that runs stay
  /// available for large requests. Falls back to the head of the pool.
  pub(crate) unsafe fn take_page(&mut self) -> Option<Page> {
    let mut prev: Option<Page> = None;
    let mut cursor = self.pages.head();
    while let Some(page) = cursor {
      let next = unsafe { page.next() };
      let joins_prev = prev.is_some_and(|p| p.precedes(page));
      let joins_next = next.is_some_and(|n| page.precedes(n));
      if !joins_prev && !joins_next {
        unsafe { self.pages.unlink(page, prev) };
        return Some(page);
      }
      prev = Some(page);
      cursor = next;
    }
    unsafe { self.pages.pop_front() }
  }

  /// Take the first run of `count` address-adjacent pages, or `None` if the
  /// pool holds no run that long. A run is never assembled from more than
  /// one source.
  pub(crate) unsafe fn take_run(&mut self, count: usize) -> Option<Page> {
    debug_assert!(count >= 1);
    let mut prev: Option<Page> = None;
    let mut run_prev: Option<Page> = None;
    let mut run_start: Option<Page> = None;
    let mut run_len = 0;

    let mut cursor = self.pages.head();
    while let Some(page) = cursor {
      match prev {
        Some(p) if run_start.is_some() && p.precedes(page) => run_len += 1,
        _ => {
          run_start = Some(page);
          run_prev = prev;
          run_len = 1;
        }
      }

      if run_len == count {
        let first = run_start?;
        unsafe { self.pages.unlink_chain(run_prev, first, page, count) };
        trace!("pool: took run of {} pages at {:#x}", count, first.addr());
        return Some(first);
      }

      prev = Some(page);
      cursor = unsafe { page.next() };
    }
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::TestPages;

  fn addresses(pool: &FreePool) -> Vec<usize> {
    unsafe { pool.iter() }.map(Page::addr).collect()
  }

  fn assert_sorted(pool: &FreePool) {
    let addrs = addresses(pool);
    assert!(addrs.windows(2).all(|w| w[0] < w[1]), "pool not sorted: {addrs:x?}");
    assert_eq!(addrs.len(), pool.len());
  }

  #[test]
  fn insertion_keeps_address_order() {
    let mut source = TestPages::new(8);
    let p: Vec<Page> = (0..8).map(|_| source.page()).collect();
    let mut pool = FreePool::new();
    for i in [5, 1, 7, 0, 3, 6, 2, 4] {
      unsafe { pool.insert_sorted(p[i]) };
      assert_sorted(&pool);
    }
    assert_eq!(addresses(&pool), p.iter().map(|p| p.addr()).collect::<Vec<_>>());
  }

  #[test]
  fn span_insertion_splits_into_pages() {
    let mut source = TestPages::new(8);
    let p: Vec<Page> = (0..8).map(|_| source.page()).collect();
    let mut pool = FreePool::new();
    unsafe {
      pool.insert_sorted(p[7]);
      pool.insert_sorted(p[0]);
      p[2].init_large(4, 1);
      pool.insert_span_sorted(p[2], 4);
    }
    assert_sorted(&pool);
    assert_eq!(pool.len(), 6);
    assert_eq!(
      addresses(&pool),
      [0, 2, 3, 4, 5, 7].iter().map(|&i| p[i].addr()).collect::<Vec<_>>()
    );
    for page in unsafe { pool.iter() } {
      assert_eq!(unsafe { page.kind() }, crate::page::PageKind::Empty);
    }
  }

  #[test]
  fn take_run_finds_adjacent_pages() {
    let mut source = TestPages::new(10);
    let p: Vec<Page> = (0..10).map(|_| source.page()).collect();
    let mut pool = FreePool::new();
    // Runs: [0], [2,3], [5,6,7], [9]
    for i in [0, 2, 3, 5, 6, 7, 9] {
      unsafe { pool.insert_sorted(p[i]) };
    }

    assert_eq!(unsafe { pool.take_run(4) }, None);
    assert_eq!(pool.len(), 7);

    assert_eq!(unsafe { pool.take_run(3) }, Some(p[5]));
    assert_sorted(&pool);
    assert_eq!(
      addresses(&pool),
      [0, 2, 3, 9].iter().map(|&i| p[i].addr()).collect::<Vec<_>>()
    );

    assert_eq!(unsafe { pool.take_run(2) }, Some(p[2]));
    assert_eq!(unsafe { pool.take_run(1) }, Some(p[0]));
    assert_eq!(unsafe { pool.take_run(1) }, Some(p[9]));
    assert!(pool.is_empty());
  }

  #[test]
  fn take_run_consumes_prefix_of_longer_run() {
    let mut source = TestPages::new(4);
    let p: Vec<Page> = (0..4).map(|_| source.page()).collect();
    let mut pool = FreePool::new();
    for &page in &p {
      unsafe { pool.insert_sorted(page) };
    }
    assert_eq!(unsafe { pool.take_run(3) }, Some(p[0]));
    assert_eq!(addresses(&pool), vec![p[3].addr()]);
  }

  #[test]
  fn take_page_prefers_isolated_page() {
    let mut source = TestPages::new(6);
    let p: Vec<Page> = (0..6).map(|_| source.page()).collect();
    let mut pool = FreePool::new();
    for i in [0, 1, 2, 4] {
      unsafe { pool.insert_sorted(p[i]) };
    }
    assert_eq!(unsafe { pool.take_page() }, Some(p[4]));
    // Only a run is left: fall back to the head.
    assert_eq!(unsafe { pool.take_page() }, Some(p[0]));
    assert_eq!(unsafe { pool.take_page() }, Some(p[1]));
    assert_eq!(unsafe { pool.take_page() }, Some(p[2]));
    assert_eq!(unsafe { pool.take_page() }, None);
  }
}
