//! Allocation failures and their errno mapping.

use thiserror::Error;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// The page gateway could not supply memory.
  #[error("out of memory requesting {bytes} bytes")]
  OutOfMemory { bytes: usize },
  /// `count * size` does not fit in `usize`.
  #[error("{count} elements of {size} bytes overflow usize")]
  Overflow { count: usize, size: usize },
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

impl AllocError {
  /// C `errno` value reported for this failure.
  pub fn errno(self) -> i32 {
    match self {
      AllocError::OutOfMemory { .. } | AllocError::Overflow { .. } => libc::ENOMEM,
    }
  }
}

/// Store `value` in the calling thread's `errno`.
#[inline]
pub(crate) fn set_errno(value: i32) {
  #[cfg(target_os = "linux")]
  unsafe {
    *libc::__errno_location() = value;
  }
  #[cfg(target_os = "android")]
  unsafe {
    *libc::__errno() = value;
  }
  #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
  unsafe {
    *libc::__error() = value;
  }
  #[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
  )))]
  let _ = value;
}
