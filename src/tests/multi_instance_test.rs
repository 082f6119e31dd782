// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Cross-process behavior, exercised with two runtimes over the same directory. Each
//! runtime has its own registry, mapping, and locks, so a second instance behaves like a
//! peer process sharing the files.

use super::runtime;
use crate::memory_file::page_size;
use crate::{Mode, OpenOptions, SyncMode};
use tempfile::TempDir;

fn multi(id: &str) -> OpenOptions {
  OpenOptions::new(id).mode(Mode::MultiProcess)
}

#[test]
fn peer_appends_become_visible() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("shared")).unwrap();
  assert!(a.set_i32("x", 1));
  assert!(a.sync(SyncMode::Sync));

  let b = runtime_b.open(multi("shared")).unwrap();
  assert_eq!(b.get_i32("x", 0), 1);

  assert!(b.set_i32("x", 2));
  assert!(b.sync(SyncMode::Sync));
  assert_eq!(a.get_i32("x", 0), 2);
}

#[test]
fn peer_removals_become_visible() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("shared")).unwrap();
  let b = runtime_b.open(multi("shared")).unwrap();

  a.set_i32("gone", 1);
  assert_eq!(b.get_i32("gone", 0), 1);

  b.remove_value_for_key("gone");
  assert!(!a.contains_key("gone"));
}

#[test]
fn peer_rewrites_are_detected_via_the_sequence() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("shared")).unwrap();
  let b = runtime_b.open(multi("shared")).unwrap();

  a.set_string("k", "original");
  assert_eq!(b.get_string("k").as_deref(), Some("original"));

  // Bulk removal compacts, which rewrites the file and bumps the sequence.
  a.set_string("doomed1", "x");
  a.set_string("doomed2", "y");
  a.remove_values_for_keys(&["doomed1".to_string(), "doomed2".to_string()]);

  assert_eq!(b.get_string("k").as_deref(), Some("original"));
  assert_eq!(b.count(), 1);
}

#[test]
fn peer_growth_is_followed_through_remap() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("growing")).unwrap();
  let b = runtime_b.open(multi("growing")).unwrap();

  // Force the file past its initial page while b holds the old, smaller mapping.
  let chunk = page_size() / 2;
  for i in 0 .. 8_u8 {
    assert!(a.set_bytes(&format!("k{i}"), &vec![i; chunk]));
  }
  assert!(a.total_size() > page_size());
  assert!(a.sync(SyncMode::Sync));

  for i in 0 .. 8_u8 {
    assert_eq!(b.get_bytes(&format!("k{i}")).as_deref(), Some(&vec![i; chunk][..]));
  }
  assert_eq!(b.total_size(), a.total_size());
}

#[test]
fn check_content_changed_polls_for_peer_writes() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("polled")).unwrap();
  let b = runtime_b.open(multi("polled")).unwrap();

  a.set_i32("k", 41);
  b.check_content_changed();
  assert_eq!(b.get_i32("k", 0), 41);
}

#[test]
fn manual_lock_excludes_peers() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(multi("locked")).unwrap();
  let b = runtime_b.open(multi("locked")).unwrap();

  assert!(a.lock());
  assert!(!b.try_lock());
  a.unlock();
  assert!(b.try_lock());
  b.unlock();
}

#[test]
fn single_process_stores_skip_the_file_lock() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a.open(OpenOptions::new("solo")).unwrap();
  let b = runtime_b.open(OpenOptions::new("solo")).unwrap();

  // Without multi-process mode both "processes" always succeed immediately.
  assert!(a.lock());
  assert!(b.try_lock());
  a.unlock();
  b.unlock();
}

#[test]
fn encrypted_multi_process_round_trip() {
  let dir = TempDir::new().unwrap();
  let runtime_a = runtime(dir.path());
  let runtime_b = runtime(dir.path());

  let a = runtime_a
    .open(multi("sealed").crypt_key(b"shared key"))
    .unwrap();
  let b = runtime_b
    .open(multi("sealed").crypt_key(b"shared key"))
    .unwrap();

  a.set_string("k", "encrypted and shared");
  assert_eq!(b.get_string("k").as_deref(), Some("encrypted and shared"));

  // Peer compaction rotates the IV; the other instance must follow.
  a.set_string("doomed", "x");
  a.remove_values_for_keys(&["doomed".to_string(), "also missing".to_string()]);
  assert_eq!(b.get_string("k").as_deref(), Some("encrypted and shared"));
}
