//! Thread-private heap: one partial-page list per size class plus the free pool.
//!
//! Page states and the list that holds them:
//!
//! | state   | list                         |
//! |---------|------------------------------|
//! | partial | `classes[class]`             |
//! | full    | none                         |
//! | empty   | `pool`, sorted by address    |
//! | span    | none (head tagged `LARGE_MARKER`) |

use core::{
  ptr::{self, NonNull},
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{
  PAGE_SIZE,
  error::{AllocError, AllocResult},
  list::PageList,
  os::PageSource,
  page::{Page, PageKind, span_pages},
  pool::FreePool,
  size_class::{CLASS_COUNT, MAX_SMALL_SIZE, bit_length, size_to_class},
};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

/// Snapshot of a heap's bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Calls made to the page gateway.
  pub gateway_calls: usize,
  /// Pages received from the gateway.
  pub pages_acquired: usize,
  /// Empty pages waiting in the free pool.
  pub pool_pages: usize,
  /// Pages linked in a size-class list.
  pub partial_pages: usize,
  /// Large spans handed out and not yet released.
  pub live_spans: usize,
  /// Releases of pointers carved by another heap, leaked.
  pub foreign_releases: usize,
}

impl HeapStats {
  const ZERO: Self = Self {
    gateway_calls: 0,
    pages_acquired: 0,
    pool_pages: 0,
    partial_pages: 0,
    live_spans: 0,
    foreign_releases: 0,
  };
}

// Each heap gets a different ID. 0 marks a heap that has not carved a page yet.
fn next_heap_id() -> u32 {
  static CTR: AtomicU32 = AtomicU32::new(1);
  CTR.fetch_add(1, Ordering::Relaxed)
}

/// Free-list table and the gateway feeding it.
///
/// A heap is not `Send`: its pages must only ever be touched from the thread
/// that owns it.
pub struct Heap<S: PageSource> {
  classes: [PageList; CLASS_COUNT],
  pool: FreePool,
  source: S,
  id: u32,
  stats: HeapStats,
}

impl<S: PageSource> Heap<S> {
  pub const fn new(source: S) -> Self {
    Self {
      classes: [const { PageList::new() }; CLASS_COUNT],
      pool: FreePool::new(),
      source,
      id: 0,
      stats: HeapStats::ZERO,
    }
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      pool_pages: self.pool.len(),
      partial_pages: self.classes.iter().map(PageList::len).sum(),
      ..self.stats
    }
  }

  /// Bytes usable through `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live pointer returned by this heap.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    unsafe { usable_size(ptr) }
  }

  fn owner_id(&mut self) -> u32 {
    if self.id == 0 {
      self.id = next_heap_id();
    }
    self.id
  }

  /// Allocate at least `size` bytes.
  pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
    if size <= MAX_SMALL_SIZE {
      self.allocate_small(size_to_class(size))
    } else {
      self.allocate_large(size)
    }
  }

  /// Allocate `count * size` zeroed bytes.
  pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> AllocResult<NonNull<u8>> {
    // Conservative: rejects some products that would still fit.
    if bit_length(count) + bit_length(size) > usize::BITS {
      return Err(AllocError::Overflow { count, size });
    }
    let total = count * size;
    let ptr = self.allocate(total)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
  }

  /// Move the block at `ptr` into a fresh block of `new_size` bytes.
  ///
  /// On failure the old block is untouched and still owned by the caller.
  ///
  /// # Safety
  ///
  /// `ptr` must be `None` or a live pointer returned by this heap.
  pub unsafe fn reallocate(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> AllocResult<NonNull<u8>> {
    let Some(old) = ptr else {
      return self.allocate(new_size);
    };
    let old_size = unsafe { usable_size(old) };
    let new = self.allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
      self.release(old);
    }
    Ok(new)
  }

  /// Give the block at `ptr` back.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live pointer returned by an allocator built on this
  /// crate, not released since.
  pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
    let page = Page::containing(ptr);

    if unsafe { page.owner() } != self.id {
      self.stats.foreign_releases += 1;
      warn!("release: {:p} belongs to heap {}, leaking", ptr, unsafe { page.owner() });
      return;
    }

    match unsafe { page.kind() } {
      PageKind::Small { class } => unsafe { self.release_small(page, class, ptr) },
      PageKind::Large { pages } => unsafe { self.release_large(page, pages) },
      PageKind::Empty => debug_assert!(false, "release: {ptr:p} points into an empty page"),
    }
  }

  // ===========================================================================
  // Small path
  // ===========================================================================

  fn allocate_small(&mut self, class: usize) -> AllocResult<NonNull<u8>> {
    loop {
      let page = match self.classes[class].head() {
        Some(page) => page,
        None => {
          let page = self.fresh_small_page(class)?;
          unsafe { self.classes[class].append(page) };
          page
        }
      };

      unsafe {
        if let Some(index) = page.find_free_block() {
          if page.is_full() {
            self.classes[class].pop_front();
          }
          return Ok(page.block_ptr(index));
        }

        debug_assert!(false, "full page {:#x} linked in class {class}", page.addr());
        self.classes[class].pop_front();
      }
    }
  }

  /// An empty page tagged for `class`: from the pool if possible.
  fn fresh_small_page(&mut self, class: usize) -> AllocResult<Page> {
    let page = match unsafe { self.pool.take_page() } {
      Some(page) => page,
      None => self.acquire(1)?,
    };
    let owner = self.owner_id();
    unsafe { page.init_small(class, owner) };
    Ok(page)
  }

  unsafe fn release_small(&mut self, page: Page, class: usize, ptr: NonNull<u8>) {
    let was_full = unsafe { page.is_full() };
    let remaining = unsafe { page.release_block(ptr) };

    if remaining == 0 {
      if !was_full {
        let removed = unsafe { self.classes[class].remove(page) };
        debug_assert!(removed, "partial page {:#x} missing from class {class}", page.addr());
      }
      unsafe { self.pool.insert_sorted(page) };
    } else if was_full {
      unsafe { self.classes[class].append(page) };
    }
  }

  // ===========================================================================
  // Large path
  // ===========================================================================

  fn allocate_large(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
    let pages = span_pages(size)
      .filter(|&pages| pages <= u32::MAX as usize)
      .ok_or(AllocError::OutOfMemory { bytes: size })?;

    let first = match unsafe { self.pool.take_run(pages) } {
      Some(page) => page,
      None => self.acquire(pages)?,
    };

    let owner = self.owner_id();
    self.stats.live_spans += 1;
    Ok(unsafe { first.init_large(pages, owner) })
  }

  #[cfg(feature = "reclaim-large")]
  unsafe fn release_large(&mut self, first: Page, pages: usize) {
    self.stats.live_spans -= 1;
    debug!("release: span of {} pages at {:#x} back to pool", pages, first.addr());
    unsafe { self.pool.insert_span_sorted(first, pages) };
  }

  #[cfg(not(feature = "reclaim-large"))]
  unsafe fn release_large(&mut self, first: Page, pages: usize) {
    self.stats.live_spans -= 1;
    debug!("release: leaking span of {} pages at {:#x}", pages, first.addr());
    let _ = (first, pages);
  }

  // ===========================================================================
  // Gateway
  // ===========================================================================

  fn acquire(&mut self, pages: usize) -> AllocResult<Page> {
    let bytes = pages.saturating_mul(PAGE_SIZE);
    self.stats.gateway_calls += 1;
    match self.source.acquire_pages(pages) {
      Some(base) => {
        self.stats.pages_acquired += pages;
        trace!("gateway: {} pages at {:p}", pages, base);
        Ok(unsafe { Page::from_base(base) })
      }
      None => {
        warn!("gateway: out of memory for {} pages", pages);
        Err(AllocError::OutOfMemory { bytes })
      }
    }
  }

  // ===========================================================================
  // Invariants
  // ===========================================================================

  /// Panics if any list or bitmap invariant is broken.
  #[cfg(test)]
  pub(crate) fn check_invariants(&self) {
    use crate::page::blocks_per_page;
    use std::collections::HashSet;

    let mut linked = HashSet::new();

    for (class, list) in self.classes.iter().enumerate() {
      let mut count = 0;
      for page in unsafe { list.iter() } {
        count += 1;
        assert!(linked.insert(page.addr()), "page {:#x} linked twice", page.addr());
        unsafe {
          assert_eq!(page.kind(), PageKind::Small { class });
          assert_eq!(page.owner(), self.id);
          let used = page.allocated_blocks();
          assert!(used > 0 && used < blocks_per_page(class), "class {class}: {used} blocks in a linked page");
          assert_eq!(page.occupied_bits(), used, "bitmap disagrees with counter");
        }
      }
      assert_eq!(count, list.len());
    }

    let mut last = 0;
    let mut count = 0;
    for page in unsafe { self.pool.iter() } {
      count += 1;
      assert!(page.addr() > last, "pool out of order at {:#x}", page.addr());
      last = page.addr();
      assert!(linked.insert(page.addr()), "page {:#x} linked twice", page.addr());
      assert_eq!(unsafe { page.kind() }, PageKind::Empty);
    }
    assert_eq!(count, self.pool.len());
  }

  #[cfg(test)]
  pub(crate) fn source(&self) -> &S {
    &self.source
  }

  #[cfg(test)]
  pub(crate) fn pool_addresses(&self) -> Vec<usize> {
    unsafe { self.pool.iter() }.map(Page::addr).collect()
  }
}

/// Bytes usable through `ptr`, which must be a live pointer returned by an
/// allocator built on this crate.
pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  unsafe { Page::containing(ptr).usable_size() }
}
