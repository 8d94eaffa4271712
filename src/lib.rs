//! Page-based allocator with power-of-two size classes.
//!
//! - Requests up to half a page are served from shared pages, one size class
//!   per page, occupancy tracked in a per-page bitmap.
//! - Larger requests get a contiguous span of whole pages, carved from runs of
//!   adjacent empty pages when possible.
//! - Every thread has its own [`Heap`], so nothing is shared or locked.
//!   Pages are never handed back to the operating system.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{NonNull, null_mut},
};

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! warn {
  ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
  ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
  ($($arg:tt)*) => {};
}

mod error;
mod heap;
mod list;
mod os;
mod page;
mod pool;
pub mod size_class;
#[cfg(test)]
mod testing;

pub use error::{AllocError, AllocResult};
pub use heap::{Heap, HeapStats};
pub use os::{MmapPages, PageSource};
pub use page::{LARGE_ALIGN, LARGE_HEADER_SIZE};
pub use size_class::MAX_SMALL_SIZE;

use error::set_errno;

// =============================================================================
// Constants
// =============================================================================

/// Unit of memory obtained from the gateway.
pub const PAGE_SIZE: usize = 4096;
const PAGE_ALIGN_MASK: usize = !(PAGE_SIZE - 1);

/// Bytes of occupancy bitmap per small page.
const BITMAP_SIZE: usize = 128;

/// Size tag of the first page of a large span.
const LARGE_MARKER: u32 = 0x8000;

const _: () = assert!(PAGE_SIZE.is_power_of_two());

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static HEAP: UnsafeCell<Heap<MmapPages>> = const { UnsafeCell::new(Heap::new(MmapPages)) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` on the calling thread's heap. `None` if the heap is already in use
/// further up the stack or thread-local storage is gone.
fn with_heap<R, F: FnOnce(&mut Heap<MmapPages>) -> R>(f: F) -> Option<R> {
  let Ok(in_alloc) = IN_ALLOC.try_with(|flag| flag.replace(true)) else {
    return None;
  };
  if in_alloc {
    return None;
  }

  let result = HEAP
    .try_with(|h| {
      let heap = unsafe { &mut *h.get() };
      f(heap)
    })
    .ok();

  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}

/// Unwrap a facade result into a raw pointer, setting `errno` on failure.
fn into_raw(result: Option<AllocResult<NonNull<u8>>>) -> *mut u8 {
  match result {
    Some(Ok(ptr)) => ptr.as_ptr(),
    Some(Err(err)) => {
      set_errno(err.errno());
      null_mut()
    }
    None => {
      set_errno(libc::ENOMEM);
      null_mut()
    }
  }
}

// =============================================================================
// Facade
// =============================================================================

/// Allocate at least `size` bytes from the calling thread's heap.
/// Null with `errno = ENOMEM` on failure.
pub fn allocate(size: usize) -> *mut u8 {
  into_raw(with_heap(|heap| heap.allocate(size)))
}

/// Allocate `count * size` zeroed bytes. Null with `errno = ENOMEM` if the
/// product may overflow or memory runs out.
pub fn allocate_zeroed(count: usize, size: usize) -> *mut u8 {
  into_raw(with_heap(|heap| heap.allocate_zeroed(count, size)))
}

/// Resize the block at `ptr`, preserving `min(old, new_size)` bytes. A null
/// `ptr` allocates. On failure returns null and `ptr` stays valid.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> *mut u8 {
  into_raw(with_heap(|heap| unsafe { heap.reallocate(NonNull::new(ptr), new_size) }))
}

/// Release the block at `ptr`. Null is a no-op.
pub unsafe fn release(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  // Without a heap (re-entry or thread teardown) the block is leaked.
  let _ = with_heap(|heap| unsafe { heap.release(ptr) });
}

/// Bytes usable through `ptr`, 0 for null.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr).map_or(0, |ptr| unsafe { heap::usable_size(ptr) })
}

/// Statistics of the calling thread's heap.
pub fn thread_stats() -> HeapStats {
  with_heap(|heap| heap.stats()).unwrap_or_default()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Size to request for `layout`, or `None` if the alignment cannot be met.
///
/// Small blocks are aligned to their class size, so small requests are padded
/// up to the alignment. Large spans only guarantee [`LARGE_ALIGN`].
#[inline]
fn request_size(layout: Layout) -> Option<usize> {
  let padded = layout.size().max(layout.align());
  if padded <= MAX_SMALL_SIZE {
    Some(padded)
  } else if layout.align() <= LARGE_ALIGN {
    Some(layout.size())
  } else {
    None
  }
}

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    match request_size(layout) {
      Some(size) => allocate(size),
      None => null_mut(),
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { release(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    match request_size(new_layout) {
      Some(size) => unsafe { reallocate(ptr, size) },
      None => null_mut(),
    }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    match request_size(layout) {
      Some(size) => allocate_zeroed(1, size),
      None => null_mut(),
    }
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut libc::c_void {
  allocate(size).cast()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut libc::c_void {
  allocate_zeroed(nmemb, size).cast()
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut libc::c_void, size: usize) -> *mut libc::c_void {
  unsafe { reallocate(ptr.cast(), size).cast() }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut libc::c_void) {
  unsafe { release(ptr.cast()) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut libc::c_void) -> usize {
  unsafe { usable_size(ptr.cast()) }
}
