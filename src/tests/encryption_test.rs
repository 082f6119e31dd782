// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::runtime;
use crate::{ErrorKind, OpenOptions, RecoverStrategy, SyncMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

fn encrypted(id: &str) -> OpenOptions {
  OpenOptions::new(id).crypt_key(b"super secret")
}

fn data_file_bytes(dir: &std::path::Path, id: &str) -> Vec<u8> {
  std::fs::read(dir.join(id)).unwrap()
}

#[test]
fn encrypted_round_trip() {
  let dir = TempDir::new().unwrap();
  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("enc")).unwrap();

  assert!(store.set_i32("int", -7));
  assert!(store.set_string("text", "plaintext marker"));
  assert!(store.set_bool("flag", true));

  assert_eq!(store.get_i32("int", 0), -7);
  assert_eq!(store.get_string("text").as_deref(), Some("plaintext marker"));
  assert!(store.get_bool("flag", false));

  // The mapped file must not leak the plaintext.
  store.sync(SyncMode::Sync);
  let raw = data_file_bytes(dir.path(), "enc");
  assert!(!raw
    .windows(b"plaintext marker".len())
    .any(|w| w == b"plaintext marker"));
}

#[test]
fn encrypted_values_survive_reopen() {
  let dir = TempDir::new().unwrap();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(encrypted("persist")).unwrap();
    for i in 0 .. 10 {
      store.set_i32(&format!("k{i}"), i * 11);
    }
  }

  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("persist")).unwrap();
  assert_eq!(store.count(), 10);
  for i in 0 .. 10 {
    assert_eq!(store.get_i32(&format!("k{i}"), -1), i * 11);
  }
}

#[test]
fn large_values_use_the_checkpoint_path() {
  let dir = TempDir::new().unwrap();
  // Values past the small-value bound skip the inline cache, so reads must restore the
  // per-record cipher state.
  let big: Vec<u8> = (0 .. 4000_u32).map(|i| (i % 251) as u8).collect();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(encrypted("large")).unwrap();
    assert!(store.set_bytes("small", b"tiny"));
    assert!(store.set_bytes("big", &big));
    assert!(store.set_bytes("after", b"after the big one"));
  }

  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("large")).unwrap();
  assert_eq!(store.get_bytes("big").as_deref(), Some(&big[..]));
  assert_eq!(store.get_bytes("small").as_deref(), Some(&b"tiny"[..]));
  assert_eq!(store.get_bytes("after").as_deref(), Some(&b"after the big one"[..]));
}

#[test]
fn wrong_key_invokes_the_error_handler() {
  let dir = TempDir::new().unwrap();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(encrypted("locked")).unwrap();
    for i in 0 .. 10 {
      store.set_string(&format!("k{i}"), "confidential");
    }
  }

  let runtime = runtime(dir.path());
  let failures = Arc::new(AtomicUsize::new(0));
  let observed = failures.clone();
  runtime.set_error_handler(Box::new(move |id, kind| {
    assert_eq!(id, "locked");
    assert_eq!(kind, ErrorKind::CrcCheckFail);
    observed.fetch_add(1, Ordering::SeqCst);
    RecoverStrategy::Discard
  }));

  let store = runtime
    .open(OpenOptions::new("locked").crypt_key(b"not the same key"))
    .unwrap();
  assert!(failures.load(Ordering::SeqCst) > 0);
  assert_eq!(store.count(), 0);
}

#[test]
fn rekey_preserves_values_and_rewrites_bytes() {
  let dir = TempDir::new().unwrap();
  let runtime = runtime(dir.path());
  let store = runtime
    .open(OpenOptions::new("rekeyed").crypt_key(b"first key"))
    .unwrap();

  store.set_string("text", "survives the rekey");
  store.set_i64("number", -99);
  store.sync(SyncMode::Sync);
  let before = data_file_bytes(dir.path(), "rekeyed");

  assert!(store.rekey(Some(b"second key")));
  store.sync(SyncMode::Sync);
  let after = data_file_bytes(dir.path(), "rekeyed");
  assert_ne!(before, after);

  assert_eq!(store.get_string("text").as_deref(), Some("survives the rekey"));
  assert_eq!(store.crypt_key().as_deref(), Some(&b"second key"[..]));

  drop(store);
  runtime.on_exit();
  let runtime = super::runtime(dir.path());
  let store = runtime
    .open(OpenOptions::new("rekeyed").crypt_key(b"second key"))
    .unwrap();
  assert_eq!(store.get_string("text").as_deref(), Some("survives the rekey"));
  assert_eq!(store.get_i64("number", 0), -99);
}

#[test]
fn rekey_to_plaintext_decrypts_the_file() {
  let dir = TempDir::new().unwrap();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(encrypted("unlocked")).unwrap();
    store.set_string("text", "now in the clear");
    assert!(store.rekey(None));
    assert_eq!(store.crypt_key(), None);
    store.sync(SyncMode::Sync);
  }

  let raw = data_file_bytes(dir.path(), "unlocked");
  assert!(raw
    .windows(b"now in the clear".len())
    .any(|w| w == b"now in the clear"));

  let runtime = runtime(dir.path());
  let store = runtime.open(OpenOptions::new("unlocked")).unwrap();
  assert_eq!(store.get_string("text").as_deref(), Some("now in the clear"));
}

#[test]
fn rekey_encrypts_a_plaintext_store() {
  let dir = TempDir::new().unwrap();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(OpenOptions::new("sealed")).unwrap();
    store.set_string("text", "about to be sealed");
    assert!(store.rekey(Some(b"fresh key")));
    store.sync(SyncMode::Sync);
  }

  let raw = data_file_bytes(dir.path(), "sealed");
  assert!(!raw
    .windows(b"about to be sealed".len())
    .any(|w| w == b"about to be sealed"));

  let runtime = runtime(dir.path());
  let store = runtime
    .open(OpenOptions::new("sealed").crypt_key(b"fresh key"))
    .unwrap();
  assert_eq!(store.get_string("text").as_deref(), Some("about to be sealed"));
}

#[test]
fn rekey_to_the_same_key_is_a_noop() {
  let dir = TempDir::new().unwrap();
  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("same")).unwrap();
  store.set_i32("k", 5);
  store.sync(SyncMode::Sync);
  let before = data_file_bytes(dir.path(), "same");

  assert!(store.rekey(Some(b"super secret")));
  store.sync(SyncMode::Sync);
  assert_eq!(before, data_file_bytes(dir.path(), "same"));
}

#[test]
fn encrypted_compaction_preserves_values() {
  let dir = TempDir::new().unwrap();
  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("churn")).unwrap();

  store.set_string("keep", "stable value");
  // Enough churn to force several compactions under a one-page file.
  for i in 0 .. 3000 {
    store.set_i32("hot", i);
  }
  assert_eq!(store.get_string("keep").as_deref(), Some("stable value"));
  assert_eq!(store.get_i32("hot", 0), 2999);

  drop(store);
  runtime.on_exit();
  let runtime = super::runtime(dir.path());
  let store = runtime.open(encrypted("churn")).unwrap();
  assert_eq!(store.get_string("keep").as_deref(), Some("stable value"));
  assert_eq!(store.get_i32("hot", 0), 2999);
}

#[test]
fn encrypted_tombstones_survive_reopen() {
  let dir = TempDir::new().unwrap();
  {
    let runtime = runtime(dir.path());
    let store = runtime.open(encrypted("tomb")).unwrap();
    store.set_i32("gone", 1);
    store.set_i32("kept", 2);
    store.remove_value_for_key("gone");
  }

  let runtime = runtime(dir.path());
  let store = runtime.open(encrypted("tomb")).unwrap();
  assert!(!store.contains_key("gone"));
  assert_eq!(store.get_i32("kept", 0), 2);
}
