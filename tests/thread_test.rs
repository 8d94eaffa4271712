//! Per-thread heaps: no page is ever shared between threads.

use std::{collections::HashSet, sync::mpsc, thread};

use pagebin::{PAGE_SIZE, allocate, release, thread_stats};

const SIZES: [usize; 7] = [8, 32, 128, 512, 2048, 3000, 5 * PAGE_SIZE];

fn page_of(ptr: *mut u8) -> usize {
  ptr as usize & !(PAGE_SIZE - 1)
}

/// Allocate one block of every size, returning the pages they landed in.
fn touch_pages() -> Vec<(usize, *mut u8)> {
  SIZES
    .iter()
    .map(|&size| {
      let ptr = allocate(size);
      assert!(!ptr.is_null());
      unsafe { ptr.write_bytes(0xAB, size) };
      (page_of(ptr), ptr)
    })
    .collect()
}

#[test]
fn test_threads_never_share_pages() {
  // First thread allocates and frees everything, then reports its pages.
  let first: HashSet<usize> = thread::spawn(|| {
    let blocks = touch_pages();
    let pages = blocks.iter().map(|&(page, _)| page).collect();
    for (_, ptr) in blocks {
      unsafe { release(ptr) };
    }
    pages
  })
  .join()
  .unwrap();

  // Second thread asks for the same sizes while keeping its blocks live.
  let (tx, rx) = mpsc::channel();
  let second = thread::spawn(move || {
    let blocks = touch_pages();
    tx.send(blocks.iter().map(|&(page, _)| page).collect::<HashSet<usize>>()).unwrap();
    for (_, ptr) in blocks {
      unsafe { release(ptr) };
    }
  });
  let second_pages = rx.recv().unwrap();
  second.join().unwrap();

  assert!(first.is_disjoint(&second_pages), "pages shared across threads");
}

#[test]
fn test_concurrent_heaps_are_independent() {
  let handles: Vec<_> = (0..4u8)
    .map(|tag| {
      thread::spawn(move || {
        let mut live = Vec::new();
        for round in 0..200usize {
          let size = SIZES[round % SIZES.len()];
          let ptr = allocate(size);
          assert!(!ptr.is_null());
          unsafe { ptr.write_bytes(tag, size) };
          live.push((ptr, size));
          if round % 3 == 0 {
            let (ptr, size) = live.swap_remove(round % live.len());
            let bytes = unsafe { core::slice::from_raw_parts(ptr, size) };
            assert!(bytes.iter().all(|&b| b == tag));
            unsafe { release(ptr) };
          }
        }
        for (ptr, size) in live {
          let bytes = unsafe { core::slice::from_raw_parts(ptr, size) };
          assert!(bytes.iter().all(|&b| b == tag));
          unsafe { release(ptr) };
        }
        thread_stats()
      })
    })
    .collect();

  for handle in handles {
    let stats = handle.join().unwrap();
    assert_eq!(stats.foreign_releases, 0);
    assert_eq!(stats.live_spans, 0);
    assert_eq!(stats.partial_pages, 0);
  }
}

#[test]
fn test_fresh_thread_starts_empty() {
  let stats = thread::spawn(thread_stats).join().unwrap();
  assert_eq!(stats, Default::default());
}

#[test]
fn test_cross_thread_release_is_leaked() {
  let ptr = thread::spawn(|| allocate(64) as usize).join().unwrap();
  let stats = thread::spawn(move || {
    unsafe { release(ptr as *mut u8) };
    thread_stats()
  })
  .join()
  .unwrap();
  assert_eq!(stats.foreign_releases, 1);
  assert_eq!(stats.gateway_calls, 0);
}
