//! Power-of-two size classes for small allocations.
//!
//! A class index is `log2(block_size) - MIN_CLASS_SHIFT`. Every request that
//! maps to the same index receives a block of exactly `class_to_size(index)`
//! bytes.

use crate::PAGE_SIZE;

/// Sizes 1..=4 share the smallest class. Anything smaller would not fit one
/// bit per block into the page bitmap.
pub const MIN_CLASS_SHIFT: u32 = 2;
/// Largest small block is half a page.
pub const MAX_CLASS_SHIFT: u32 = MAX_SMALL_SIZE.trailing_zeros();
/// Largest request served from a shared page.
pub const MAX_SMALL_SIZE: usize = PAGE_SIZE / 2;
/// Number of small size classes.
pub const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

const _: () = assert!(MAX_SMALL_SIZE.is_power_of_two());
const _: () = assert!(class_to_size(0) == 1 << MIN_CLASS_SHIFT);
const _: () = assert!(class_to_size(CLASS_COUNT - 1) == MAX_SMALL_SIZE);

/// Position of the highest set bit, `None` for zero.
#[inline(always)]
pub const fn highest_set_bit(x: usize) -> Option<u32> {
  if x == 0 {
    None
  } else {
    Some(usize::BITS - 1 - x.leading_zeros())
  }
}

/// Number of bits needed to represent `x` (0 for 0).
#[inline(always)]
pub const fn bit_length(x: usize) -> u32 {
  match highest_set_bit(x) {
    Some(bit) => bit + 1,
    None => 0,
  }
}

/// Smallest power of two `>= x`. `None` if that does not fit in `usize`.
#[inline(always)]
pub const fn round_up_to_power_of_two(x: usize) -> Option<usize> {
  if x <= 1 {
    return Some(1);
  }
  match highest_set_bit(x - 1) {
    Some(bit) if bit + 1 < usize::BITS => Some(1 << (bit + 1)),
    _ => None,
  }
}

/// Class index for a small request. `size` must not exceed [`MAX_SMALL_SIZE`].
#[inline(always)]
pub const fn size_to_class(size: usize) -> usize {
  debug_assert!(size <= MAX_SMALL_SIZE);
  let shift = match highest_set_bit(size) {
    Some(bit) if size & (size - 1) != 0 => bit + 1,
    Some(bit) => bit,
    None => 0,
  };
  if shift < MIN_CLASS_SHIFT {
    0
  } else {
    (shift - MIN_CLASS_SHIFT) as usize
  }
}

/// Block size in bytes served by `class`.
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  1 << (class as u32 + MIN_CLASS_SHIFT)
}

/// Class index of a block size stored in a page header.
#[inline(always)]
pub(crate) const fn block_size_to_class(block_size: usize) -> usize {
  debug_assert!(block_size.is_power_of_two());
  (block_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize
}
