//! Intrusive singly-linked list of pages.
//!
//! Links live in the page headers (`next_free`). The list never owns its
//! pages; they stay mapped for the life of the process.

use crate::page::Page;

pub(crate) struct PageList {
  start: Option<Page>,
  end: Option<Page>,
  len: usize,
}

impl PageList {
  pub(crate) const fn new() -> Self {
    Self {
      start: None,
      end: None,
      len: 0,
    }
  }

  #[inline]
  pub(crate) fn head(&self) -> Option<Page> {
    self.start
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[cfg(test)]
  pub(crate) fn is_empty(&self) -> bool {
    self.start.is_none()
  }

  /// Append `page` at the tail.
  pub(crate) unsafe fn append(&mut self, page: Page) {
    unsafe { page.set_next(None) };
    match self.end {
      Some(end) => unsafe { end.set_next(Some(page)) },
      None => self.start = Some(page),
    }
    self.end = Some(page);
    self.len += 1;
  }

  pub(crate) unsafe fn pop_front(&mut self) -> Option<Page> {
    let page = self.start?;
    unsafe { self.unlink(page, None) };
    Some(page)
  }

  /// Remove `page`, whose predecessor is `prev` (`None` for the head).
  #[inline]
  pub(crate) unsafe fn unlink(&mut self, page: Page, prev: Option<Page>) {
    unsafe { self.unlink_chain(prev, page, page, 1) };
  }

  /// Remove the `count` linked pages `first..=last`, whose predecessor is
  /// `prev`. The chain keeps its internal links; `last` is detached.
  pub(crate) unsafe fn unlink_chain(&mut self, prev: Option<Page>, first: Page, last: Page, count: usize) {
    let after = unsafe { last.next() };
    match prev {
      Some(prev) => {
        debug_assert_eq!(unsafe { prev.next() }, Some(first));
        unsafe { prev.set_next(after) };
      }
      None => {
        debug_assert_eq!(self.start, Some(first));
        self.start = after;
      }
    }
    if after.is_none() {
      self.end = prev;
    }
    unsafe { last.set_next(None) };
    self.len -= count;
  }

  /// Splice the already linked chain `first..=last` after `prev` (`None`
  /// inserts at the head).
  pub(crate) unsafe fn splice_after(&mut self, prev: Option<Page>, first: Page, last: Page, count: usize) {
    let after = match prev {
      Some(prev) => unsafe { prev.next() },
      None => self.start,
    };
    unsafe { last.set_next(after) };
    match prev {
      Some(prev) => unsafe { prev.set_next(Some(first)) },
      None => self.start = Some(first),
    }
    if after.is_none() {
      self.end = Some(last);
    }
    self.len += count;
  }

  /// Walk to `page` and report its predecessor. `None` if not linked here.
  pub(crate) unsafe fn predecessor(&self, page: Page) -> Option<Option<Page>> {
    let mut prev = None;
    let mut cursor = self.start;
    while let Some(current) = cursor {
      if current == page {
        return Some(prev);
      }
      prev = Some(current);
      cursor = unsafe { current.next() };
    }
    None
  }

  /// Remove `page` if it is linked here.
  pub(crate) unsafe fn remove(&mut self, page: Page) -> bool {
    match unsafe { self.predecessor(page) } {
      Some(prev) => {
        unsafe { self.unlink(page, prev) };
        true
      }
      None => false,
    }
  }

  /// Iterate the pages head to tail. The list must not change while iterating.
  #[cfg(test)]
  pub(crate) unsafe fn iter(&self) -> Iter {
    Iter { cursor: self.start }
  }
}

#[cfg(test)]
pub(crate) struct Iter {
  cursor: Option<Page>,
}

#[cfg(test)]
impl Iterator for Iter {
  type Item = Page;

  fn next(&mut self) -> Option<Page> {
    let page = self.cursor?;
    self.cursor = unsafe { page.next() };
    Some(page)
  }
}
