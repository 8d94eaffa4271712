//! Page headers and the page descriptor.
//!
//! Every page handed out by the gateway starts with a [`PageHeader`]. Small
//! pages use the whole header, including the occupancy bitmap. The first page
//! of a large span only uses the fields before the bitmap, tagged with
//! [`LARGE_MARKER`]; everything after [`LARGE_HEADER_SIZE`] is user memory.
//!
//! All address arithmetic on pages lives in this module.

use core::{
  mem::{offset_of, size_of},
  ptr::{NonNull, null_mut},
};

use crate::{
  BITMAP_SIZE, LARGE_MARKER, PAGE_ALIGN_MASK, PAGE_SIZE,
  size_class::{CLASS_COUNT, MAX_SMALL_SIZE, block_size_to_class, class_to_size},
};

/// Bytes reserved at the start of a large span, rounded so that the payload
/// keeps 16-byte alignment.
pub const LARGE_HEADER_SIZE: usize = align_up(offset_of!(PageHeader, bitmap), LARGE_ALIGN);
/// Alignment of the payload of a large span.
pub const LARGE_ALIGN: usize = 16;

const _: () = assert!(LARGE_MARKER as usize > MAX_SMALL_SIZE);
const _: () = assert!(size_of::<PageHeader>() < MAX_SMALL_SIZE);
const _: () = assert!(blocks_per_page(0) <= BITMAP_SIZE * 8);
const _: () = assert!(blocks_per_page(CLASS_COUNT - 1) >= 1);

#[repr(C)]
pub(crate) struct PageHeader {
  /// Block size in bytes, `LARGE_MARKER` for a span, 0 for a pool page.
  block_size: u32,
  /// Occupied blocks. Page count for a large span.
  allocated_blocks: u32,
  /// Id of the heap that carved this page.
  owner: u32,
  /// Intrusive link, only meaningful while the page sits in a list.
  next_free: *mut PageHeader,
  /// One bit per block, `1` = occupied. Absent on large spans.
  bitmap: [u8; BITMAP_SIZE],
}

/// What a page currently holds, decoded from its size tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageKind {
  /// Plain page waiting in the free pool.
  Empty,
  Small { class: usize },
  /// First page of a span of `pages` pages.
  Large { pages: usize },
}

/// Offset of block 0: the header rounded up to a multiple of the block size,
/// so that block indices follow from pure address arithmetic.
#[inline(always)]
pub(crate) const fn header_offset(class: usize) -> usize {
  align_up(size_of::<PageHeader>(), class_to_size(class))
}

/// Blocks of `class` that fit in one page after the header.
#[inline(always)]
pub(crate) const fn blocks_per_page(class: usize) -> usize {
  (PAGE_SIZE - header_offset(class)) / class_to_size(class)
}

/// Pages needed to hold `size` bytes after the large header.
#[inline]
pub(crate) fn span_pages(size: usize) -> Option<usize> {
  size
    .checked_add(LARGE_HEADER_SIZE)
    .map(|total| total.div_ceil(PAGE_SIZE))
}

/// Typed view of a page-aligned header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Page(NonNull<PageHeader>);

impl Page {
  /// The page containing `ptr`.
  #[inline]
  pub(crate) fn containing(ptr: NonNull<u8>) -> Self {
    let base = ptr.as_ptr().map_addr(|addr| addr & PAGE_ALIGN_MASK);
    // SAFETY: pointers handed out by the allocator never live in page 0.
    Self(unsafe { NonNull::new_unchecked(base.cast()) })
  }

  /// # Safety
  ///
  /// `base` must be page-aligned and point at memory owned by the allocator.
  #[inline]
  pub(crate) unsafe fn from_base(base: NonNull<u8>) -> Self {
    debug_assert_eq!(base.as_ptr() as usize & !PAGE_ALIGN_MASK, 0);
    Self(base.cast())
  }

  #[inline]
  pub(crate) fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  /// Address one past the end of this page.
  #[inline]
  pub(crate) fn end(self) -> usize {
    self.addr() + PAGE_SIZE
  }

  /// Whether `other` starts exactly where this page ends.
  #[inline]
  pub(crate) fn precedes(self, other: Page) -> bool {
    self.end() == other.addr()
  }

  /// The page `n` pages after this one.
  ///
  /// # Safety
  ///
  /// The result must still lie inside the same gateway region.
  #[inline]
  pub(crate) unsafe fn add(self, n: usize) -> Self {
    Self(unsafe { self.0.byte_add(n * PAGE_SIZE) })
  }

  #[inline]
  fn raw(self) -> *mut PageHeader {
    self.0.as_ptr()
  }

  // ---------------------------------------------------------------------------
  // Header fields
  // ---------------------------------------------------------------------------

  #[inline]
  pub(crate) unsafe fn kind(self) -> PageKind {
    let tag = unsafe { (*self.raw()).block_size };
    match tag {
      0 => PageKind::Empty,
      LARGE_MARKER => PageKind::Large {
        pages: unsafe { (*self.raw()).allocated_blocks } as usize,
      },
      size => PageKind::Small {
        class: block_size_to_class(size as usize),
      },
    }
  }

  #[inline]
  pub(crate) unsafe fn owner(self) -> u32 {
    unsafe { (*self.raw()).owner }
  }

  #[inline]
  pub(crate) unsafe fn allocated_blocks(self) -> usize {
    unsafe { (*self.raw()).allocated_blocks as usize }
  }

  #[inline]
  pub(crate) unsafe fn next(self) -> Option<Page> {
    NonNull::new(unsafe { (*self.raw()).next_free }).map(Page)
  }

  #[inline]
  pub(crate) unsafe fn set_next(self, next: Option<Page>) {
    unsafe { (*self.raw()).next_free = next.map_or(null_mut(), Page::raw) };
  }

  /// Bytes usable through a pointer into this page.
  pub(crate) unsafe fn usable_size(self) -> usize {
    match unsafe { self.kind() } {
      PageKind::Small { class } => class_to_size(class),
      PageKind::Large { pages } => pages * PAGE_SIZE - LARGE_HEADER_SIZE,
      PageKind::Empty => 0,
    }
  }

  // ---------------------------------------------------------------------------
  // Re-tagging
  // ---------------------------------------------------------------------------

  /// Write a fresh small header. Any previous contents are discarded.
  pub(crate) unsafe fn init_small(self, class: usize, owner: u32) {
    unsafe {
      self.raw().write(PageHeader {
        block_size: class_to_size(class) as u32,
        allocated_blocks: 0,
        owner,
        next_free: null_mut(),
        bitmap: [0; BITMAP_SIZE],
      })
    };
  }

  /// Tag this page as the head of a `pages`-page span and return the payload.
  pub(crate) unsafe fn init_large(self, pages: usize, owner: u32) -> NonNull<u8> {
    debug_assert!(pages >= 1 && pages <= u32::MAX as usize);
    let header = self.raw();
    unsafe {
      (*header).block_size = LARGE_MARKER;
      (*header).allocated_blocks = pages as u32;
      (*header).owner = owner;
      (*header).next_free = null_mut();
      self.0.cast::<u8>().byte_add(LARGE_HEADER_SIZE)
    }
  }

  /// Drop any size tag. Only the shared prefix is touched, so this is safe on
  /// pages whose bitmap area holds user data.
  pub(crate) unsafe fn reset_empty(self) {
    let header = self.raw();
    unsafe {
      (*header).block_size = 0;
      (*header).allocated_blocks = 0;
      (*header).owner = 0;
      (*header).next_free = null_mut();
    }
  }

  // ---------------------------------------------------------------------------
  // Bitmap
  // ---------------------------------------------------------------------------

  #[inline]
  unsafe fn class(self) -> usize {
    block_size_to_class(unsafe { (*self.raw()).block_size } as usize)
  }

  #[inline]
  pub(crate) unsafe fn capacity(self) -> usize {
    blocks_per_page(unsafe { self.class() })
  }

  #[inline]
  pub(crate) unsafe fn is_full(self) -> bool {
    unsafe { self.allocated_blocks() == self.capacity() }
  }

  /// Address of block `index`.
  #[inline]
  pub(crate) unsafe fn block_ptr(self, index: usize) -> NonNull<u8> {
    let class = unsafe { self.class() };
    let offset = header_offset(class) + index * class_to_size(class);
    debug_assert!(offset < PAGE_SIZE);
    unsafe { self.0.cast::<u8>().byte_add(offset) }
  }

  /// Block index of `ptr`, which must point at the start of a block.
  #[inline]
  pub(crate) unsafe fn block_index(self, ptr: NonNull<u8>) -> usize {
    let class = unsafe { self.class() };
    let first = self.addr() + header_offset(class);
    let offset = ptr.as_ptr() as usize - first;
    debug_assert_eq!(offset % class_to_size(class), 0, "pointer {ptr:p} is not a block start");
    offset / class_to_size(class)
  }

  /// Claim the first free block in (byte, bit) order and count it.
  /// `None` only when the page is full.
  pub(crate) unsafe fn find_free_block(self) -> Option<usize> {
    let capacity = unsafe { self.capacity() };
    let header = self.raw();
    for byte in 0..capacity.div_ceil(8) {
      let bits = unsafe { (*header).bitmap[byte] };
      if bits == u8::MAX {
        continue;
      }
      let bit = bits.trailing_ones() as usize;
      let index = byte * 8 + bit;
      if index >= capacity {
        break;
      }
      unsafe {
        (*header).bitmap[byte] = bits | (1 << bit);
        (*header).allocated_blocks += 1;
      }
      return Some(index);
    }
    None
  }

  /// Clear the bit of the block holding `ptr` and return the blocks still
  /// occupied. Block contents are left alone.
  pub(crate) unsafe fn release_block(self, ptr: NonNull<u8>) -> usize {
    let index = unsafe { self.block_index(ptr) };
    let header = self.raw();
    let mask = 1u8 << (index % 8);
    unsafe {
      debug_assert!((*header).bitmap[index / 8] & mask != 0, "double free of {ptr:p}");
      debug_assert!((*header).allocated_blocks > 0);
      (*header).bitmap[index / 8] &= !mask;
      (*header).allocated_blocks -= 1;
      (*header).allocated_blocks as usize
    }
  }

  #[cfg(test)]
  pub(crate) unsafe fn occupied_bits(self) -> usize {
    let bitmap = unsafe { &(*self.raw()).bitmap };
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
  }

  #[cfg(test)]
  pub(crate) unsafe fn is_occupied(self, index: usize) -> bool {
    unsafe { (*self.raw()).bitmap[index / 8] & (1 << (index % 8)) != 0 }
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{os::MmapPages, os::PageSource, size_class::size_to_class};

  fn fresh_page() -> Page {
    let base = MmapPages.acquire_pages(1).expect("mmap failed");
    unsafe { Page::from_base(base) }
  }

  #[test]
  fn header_offset_is_block_aligned() {
    for class in 0..CLASS_COUNT {
      let offset = header_offset(class);
      assert!(offset >= size_of::<PageHeader>());
      assert_eq!(offset % class_to_size(class), 0);
      assert!(blocks_per_page(class) >= 1);
      assert!(offset + blocks_per_page(class) * class_to_size(class) <= PAGE_SIZE);
    }
  }

  #[test]
  fn largest_class_fits_one_block() {
    assert_eq!(blocks_per_page(CLASS_COUNT - 1), 1);
    assert_eq!(blocks_per_page(size_to_class(1024)), 3);
  }

  #[test]
  fn span_pages_rounds_up() {
    assert_eq!(span_pages(PAGE_SIZE / 2 + 1), Some(1));
    assert_eq!(span_pages(PAGE_SIZE - LARGE_HEADER_SIZE), Some(1));
    assert_eq!(span_pages(PAGE_SIZE - LARGE_HEADER_SIZE + 1), Some(2));
    assert_eq!(span_pages(PAGE_SIZE * 3 + 1), Some(4));
    assert_eq!(span_pages(usize::MAX), None);
  }

  #[test]
  fn containing_masks_to_page_base() {
    let page = fresh_page();
    unsafe { page.init_small(0, 1) };
    for index in [0, 1, 17, blocks_per_page(0) - 1] {
      let block = unsafe { page.block_ptr(index) };
      assert_eq!(Page::containing(block), page);
      assert_eq!(unsafe { page.block_index(block) }, index);
    }
  }

  #[test]
  fn find_free_block_fills_in_order() {
    let page = fresh_page();
    let class = size_to_class(64);
    unsafe { page.init_small(class, 1) };
    let capacity = blocks_per_page(class);
    for expected in 0..capacity {
      assert_eq!(unsafe { page.find_free_block() }, Some(expected));
    }
    unsafe {
      assert!(page.is_full());
      assert_eq!(page.find_free_block(), None);
      assert_eq!(page.occupied_bits(), capacity);
    }
  }

  #[test]
  fn release_block_reopens_slot() {
    let page = fresh_page();
    let class = size_to_class(16);
    unsafe { page.init_small(class, 1) };
    for _ in 0..10 {
      unsafe { page.find_free_block() };
    }
    let victim = unsafe { page.block_ptr(3) };
    assert_eq!(unsafe { page.release_block(victim) }, 9);
    unsafe {
      assert!(!page.is_occupied(3));
      assert_eq!(page.find_free_block(), Some(3));
      assert_eq!(page.allocated_blocks(), 10);
      assert_eq!(page.occupied_bits(), 10);
    }
  }

  #[test]
  fn kinds_decode_from_tag() {
    let page = fresh_page();
    unsafe {
      assert_eq!(page.kind(), PageKind::Empty);
      page.init_small(4, 7);
      assert_eq!(page.kind(), PageKind::Small { class: 4 });
      assert_eq!(page.owner(), 7);
      let payload = page.init_large(1, 9);
      assert_eq!(payload.as_ptr() as usize, page.addr() + LARGE_HEADER_SIZE);
      assert_eq!(payload.as_ptr() as usize % LARGE_ALIGN, 0);
      assert_eq!(page.kind(), PageKind::Large { pages: 1 });
      assert_eq!(page.usable_size(), PAGE_SIZE - LARGE_HEADER_SIZE);
      page.reset_empty();
      assert_eq!(page.kind(), PageKind::Empty);
      assert_eq!(page.usable_size(), 0);
    }
  }
}
