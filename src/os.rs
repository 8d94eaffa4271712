//! Page allocator gateway.

use core::ptr::{NonNull, null_mut};

use crate::PAGE_SIZE;

/// Source of fresh pages.
///
/// # Safety
///
/// A returned region must be `count * PAGE_SIZE` bytes, `PAGE_SIZE`-aligned,
/// zero-filled, readable and writable, must never overlap a region returned
/// earlier, and must stay mapped for as long as the heap using it exists.
pub unsafe trait PageSource {
  /// Acquire `count` contiguous pages. `None` means out of memory.
  fn acquire_pages(&mut self, count: usize) -> Option<NonNull<u8>>;
}

/// Anonymous private mappings straight from the kernel. Never unmapped.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapPages;

unsafe impl PageSource for MmapPages {
  fn acquire_pages(&mut self, count: usize) -> Option<NonNull<u8>> {
    let size = count.checked_mul(PAGE_SIZE)?;
    if size == 0 {
      return None;
    }
    NonNull::new(unsafe { os_mmap(size) })
  }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}
