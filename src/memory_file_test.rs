// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{page_size, round_up_to_page, MemoryFile, SyncMode};
use tempfile::TempDir;

#[test]
fn open_rounds_up_to_a_page() {
  let dir = TempDir::new().unwrap();
  let file = MemoryFile::open(dir.path().join("f"), 1).unwrap();
  assert_eq!(file.len(), page_size());
  assert!(file.as_slice().iter().all(|b| *b == 0));
}

#[test]
fn open_keeps_a_larger_existing_file() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("f");
  {
    let mut file = MemoryFile::open(&path, page_size()).unwrap();
    file.ensure_size(page_size() * 4).unwrap();
  }
  let file = MemoryFile::open(&path, page_size()).unwrap();
  assert_eq!(file.len(), page_size() * 4);
}

#[test]
fn ensure_size_grows_and_preserves_content() {
  let dir = TempDir::new().unwrap();
  let mut file = MemoryFile::open(dir.path().join("f"), page_size()).unwrap();
  file.as_mut_slice()[.. 4].copy_from_slice(b"abcd");

  file.ensure_size(page_size() + 1).unwrap();
  assert_eq!(file.len(), page_size() * 2);
  assert_eq!(&file.as_slice()[.. 4], b"abcd");
  // The grown tail is zero-filled.
  assert!(file.as_slice()[page_size() ..].iter().all(|b| *b == 0));
}

#[test]
fn ensure_size_is_a_noop_when_large_enough() {
  let dir = TempDir::new().unwrap();
  let mut file = MemoryFile::open(dir.path().join("f"), page_size() * 2).unwrap();
  file.ensure_size(10).unwrap();
  assert_eq!(file.len(), page_size() * 2);
}

#[test]
fn truncate_shrinks() {
  let dir = TempDir::new().unwrap();
  let mut file = MemoryFile::open(dir.path().join("f"), page_size() * 4).unwrap();
  file.truncate(page_size()).unwrap();
  assert_eq!(file.len(), page_size());
  assert_eq!(file.file().metadata().unwrap().len(), page_size() as u64);
}

#[test]
fn msync_flushes_content_to_disk() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("f");
  let mut file = MemoryFile::open(&path, page_size()).unwrap();
  file.as_mut_slice()[.. 5].copy_from_slice(b"hello");
  file.msync(SyncMode::Sync).unwrap();

  let on_disk = std::fs::read(&path).unwrap();
  assert_eq!(&on_disk[.. 5], b"hello");
}

#[test]
fn reload_picks_up_external_resize() {
  let dir = TempDir::new().unwrap();
  let path = dir.path().join("f");
  let mut file = MemoryFile::open(&path, page_size()).unwrap();

  // Another handle on the same file grows it.
  let other = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
  other.set_len((page_size() * 2) as u64).unwrap();

  file.reload().unwrap();
  assert_eq!(file.len(), page_size() * 2);
}

#[test]
fn round_up_to_page_boundaries() {
  let page = page_size();
  assert_eq!(round_up_to_page(0), page);
  assert_eq!(round_up_to_page(1), page);
  assert_eq!(round_up_to_page(page), page);
  assert_eq!(round_up_to_page(page + 1), page * 2);
}
