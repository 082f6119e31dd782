// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! The store: a durable map from string keys to typed values, backed by a memory-mapped
//! append log.
//!
//! Every typed setter computes the exact encoded size, encodes into a buffer of that
//! size, and hands it to the byte-level write path; every typed getter wraps the live
//! value bytes in a coded input and decodes one value, falling back to the supplied
//! default on a missing key or a malformed record.

mod io;

use crate::coded::{self, CodedInput, CodedOutput};
use crate::memory_file::SyncMode;
use crate::runtime::Handlers;
use crate::Result;
use io::StoreInner;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Whether a store may be shared with other processes. Multi-process stores bracket
/// every operation with the advisory file lock and watch the sidecar for peer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  SingleProcess,
  MultiProcess,
}

//
// Store
//

pub struct Store {
  id: String,
  instance_key: String,
  inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for Store {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Store").field("id", &self.id).finish_non_exhaustive()
  }
}

impl Store {
  pub(crate) fn open(
    id: &str,
    instance_key: String,
    data_path: &Path,
    meta_path: &Path,
    mode: Mode,
    crypt_key: Option<&[u8]>,
    handlers: Arc<Handlers>,
  ) -> Result<Self> {
    let inner = StoreInner::open(
      id,
      data_path,
      meta_path,
      mode == Mode::MultiProcess,
      crypt_key,
      handlers,
    )?;
    Ok(Self {
      id: id.to_string(),
      instance_key,
      inner: Mutex::new(inner),
    })
  }

  #[must_use]
  pub fn id(&self) -> &str {
    &self.id
  }

  pub(crate) fn instance_key(&self) -> &str {
    &self.instance_key
  }

  // Setters. Each returns whether the value was durably appended.

  pub fn set_bool(&self, key: &str, value: bool) -> bool {
    let mut buf = [0_u8; 1];
    let encoded = CodedOutput::new(&mut buf).write_bool(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_i32(&self, key: &str, value: i32) -> bool {
    let mut buf = vec![0_u8; coded::int32_size(value)];
    let encoded = CodedOutput::new(&mut buf).write_int32(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_u32(&self, key: &str, value: u32) -> bool {
    let mut buf = vec![0_u8; coded::uint32_size(value)];
    let encoded = CodedOutput::new(&mut buf).write_uint32(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_i64(&self, key: &str, value: i64) -> bool {
    let mut buf = vec![0_u8; coded::int64_size(value)];
    let encoded = CodedOutput::new(&mut buf).write_int64(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_u64(&self, key: &str, value: u64) -> bool {
    let mut buf = vec![0_u8; coded::uint64_size(value)];
    let encoded = CodedOutput::new(&mut buf).write_uint64(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_f32(&self, key: &str, value: f32) -> bool {
    let mut buf = [0_u8; 4];
    let encoded = CodedOutput::new(&mut buf).write_float(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  pub fn set_f64(&self, key: &str, value: f64) -> bool {
    let mut buf = [0_u8; 8];
    let encoded = CodedOutput::new(&mut buf).write_double(value);
    encoded.is_ok() && self.set_data(key, &buf, false)
  }

  /// Store a string. The raw bytes are length-prefixed inside the record, so an empty
  /// string round-trips rather than reading as a removal.
  pub fn set_string(&self, key: &str, value: &str) -> bool {
    self.set_data(key, value.as_bytes(), true)
  }

  pub fn set_bytes(&self, key: &str, value: &[u8]) -> bool {
    self.set_data(key, value, true)
  }

  /// Store a list of strings as concatenated length-prefixed items.
  pub fn set_string_list(&self, key: &str, values: &[String]) -> bool {
    let size: usize = values.iter().map(|v| coded::data_size(v.len())).sum();
    let mut buf = vec![0_u8; size];
    let mut output = CodedOutput::new(&mut buf);
    for value in values {
      if output.write_string(value).is_err() {
        return false;
      }
    }
    self.set_data(key, &buf, true)
  }

  // Getters.

  pub fn get_bool(&self, key: &str, default: bool) -> bool {
    self.decode_scalar(key, default, |input| input.read_bool())
  }

  pub fn get_i32(&self, key: &str, default: i32) -> i32 {
    self.decode_scalar(key, default, |input| input.read_int32())
  }

  pub fn get_u32(&self, key: &str, default: u32) -> u32 {
    self.decode_scalar(key, default, |input| input.read_uint32())
  }

  pub fn get_i64(&self, key: &str, default: i64) -> i64 {
    self.decode_scalar(key, default, |input| input.read_int64())
  }

  pub fn get_u64(&self, key: &str, default: u64) -> u64 {
    self.decode_scalar(key, default, |input| input.read_uint64())
  }

  pub fn get_f32(&self, key: &str, default: f32) -> f32 {
    self.decode_scalar(key, default, |input| input.read_float())
  }

  pub fn get_f64(&self, key: &str, default: f64) -> f64 {
    self.decode_scalar(key, default, |input| input.read_double())
  }

  #[must_use]
  pub fn get_string(&self, key: &str) -> Option<String> {
    self.decode_scalar(key, None, |input| input.read_string().map(Some))
  }

  #[must_use]
  pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
    self.decode_scalar(key, None, |input| input.read_data().map(|d| Some(d.to_vec())))
  }

  #[must_use]
  pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
    self.decode_scalar(key, None, |input| {
      let content = input.read_data()?;
      let mut items = CodedInput::new(content);
      let mut values = Vec::new();
      while !items.is_at_end() {
        values.push(items.read_string()?);
      }
      Ok(Some(values))
    })
  }

  /// Byte length of the stored value. With `actual`, a length-prefixed value reports its
  /// content length instead of its full encoding.
  #[must_use]
  pub fn value_size(&self, key: &str, actual: bool) -> usize {
    if key.is_empty() {
      return 0;
    }
    let mut inner = self.inner.lock();
    if let Err(e) = inner.check_load_data() {
      log::error!("[{}] load failed: {e}", self.id);
      return 0;
    }
    let Some(data) = inner.value_bytes(key) else {
      return 0;
    };
    if actual {
      let mut input = CodedInput::new(&data);
      if let Ok(content) = input.read_data() {
        if input.is_at_end() {
          return content.len();
        }
      }
    }
    data.len()
  }

  // Enumeration.

  #[must_use]
  pub fn contains_key(&self, key: &str) -> bool {
    if key.is_empty() {
      return false;
    }
    let mut inner = self.inner.lock();
    if inner.check_load_data().is_err() {
      return false;
    }
    inner.index().contains(key)
  }

  #[must_use]
  pub fn count(&self) -> usize {
    let mut inner = self.inner.lock();
    if inner.check_load_data().is_err() {
      return 0;
    }
    inner.index().len()
  }

  #[must_use]
  pub fn all_keys(&self) -> Vec<String> {
    let mut inner = self.inner.lock();
    if inner.check_load_data().is_err() {
      return Vec::new();
    }
    inner.index().keys()
  }

  /// Live payload bytes, including overwritten and removed records not yet compacted.
  #[must_use]
  pub fn actual_size(&self) -> usize {
    let mut inner = self.inner.lock();
    let _ = inner.check_load_data();
    inner.actual_size()
  }

  /// Size of the mapped data file.
  #[must_use]
  pub fn total_size(&self) -> usize {
    let mut inner = self.inner.lock();
    let _ = inner.check_load_data();
    inner.total_size()
  }

  #[must_use]
  pub fn is_file_valid(&self) -> bool {
    self.inner.lock().is_file_valid()
  }

  // Removal.

  /// Append a tombstone for `key`. Returns whether the key was present.
  pub fn remove_value_for_key(&self, key: &str) -> bool {
    if key.is_empty() {
      return false;
    }
    let mut inner = self.inner.lock();
    match inner.remove_data(key) {
      Ok(removed) => removed,
      Err(e) => {
        log::error!("[{}] failed to remove key {key:?}: {e}", self.id);
        false
      },
    }
  }

  /// Remove several keys. A single key takes the append path; more than one erases from
  /// the index and compacts.
  pub fn remove_values_for_keys(&self, keys: &[String]) -> usize {
    match keys {
      [] => 0,
      [key] => usize::from(self.remove_value_for_key(key)),
      _ => {
        let mut inner = self.inner.lock();
        match inner.remove_multiple(keys) {
          Ok(removed) => removed,
          Err(e) => {
            log::error!("[{}] failed to remove keys: {e}", self.id);
            0
          },
        }
      },
    }
  }

  /// Reset to an empty store, truncating the file back to one page.
  pub fn clear_all(&self) -> bool {
    let mut inner = self.inner.lock();
    match inner.clear_all() {
      Ok(()) => true,
      Err(e) => {
        log::error!("[{}] clear_all failed: {e}", self.id);
        false
      },
    }
  }

  /// Drop the in-memory index; the next operation reloads from the mapping.
  pub fn clear_memory_cache(&self) {
    self.inner.lock().clear_memory_cache();
  }

  /// Rewrite the file to exactly the live set.
  pub fn full_write_back(&self) -> bool {
    let mut inner = self.inner.lock();
    let result = inner
      .check_load_data()
      .and_then(|()| inner.full_write_back());
    match result {
      Ok(()) => true,
      Err(e) => {
        log::error!("[{}] full write-back failed: {e}", self.id);
        false
      },
    }
  }

  // Durability and cross-process coordination.

  pub fn sync(&self, mode: SyncMode) -> bool {
    let mut inner = self.inner.lock();
    match inner.sync(mode) {
      Ok(()) => true,
      Err(e) => {
        log::error!("[{}] msync failed: {e}", self.id);
        false
      },
    }
  }

  /// Poll for out-of-band changes from peer processes.
  pub fn check_content_changed(&self) {
    let mut inner = self.inner.lock();
    if let Err(e) = inner.check_load_data() {
      log::error!("[{}] load failed: {e}", self.id);
    }
  }

  /// Hold the exclusive inter-process lock across several operations.
  pub fn lock(&self) -> bool {
    self.inner.lock().process_lock().is_ok()
  }

  pub fn unlock(&self) {
    self.inner.lock().process_unlock();
  }

  pub fn try_lock(&self) -> bool {
    self.inner.lock().try_process_lock().unwrap_or(false)
  }

  // Encryption management.

  /// The configured crypt key with zero padding trimmed, if encryption is on.
  #[must_use]
  pub fn crypt_key(&self) -> Option<Vec<u8>> {
    self.inner.lock().crypt_key()
  }

  /// Re-encrypt the file under `new_key` (or decrypt it with `None`) via a full
  /// write-back.
  pub fn rekey(&self, new_key: Option<&[u8]>) -> bool {
    let mut inner = self.inner.lock();
    match inner.rekey(new_key) {
      Ok(()) => true,
      Err(e) => {
        log::error!("[{}] rekey failed: {e}", self.id);
        false
      },
    }
  }

  /// Swap the in-memory key without rewriting the file, for a store whose on-disk
  /// content was rekeyed by a peer process.
  pub fn check_re_set_crypt_key(&self, new_key: Option<&[u8]>) {
    let mut inner = self.inner.lock();
    if let Err(e) = inner.check_re_set_crypt_key(new_key) {
      log::error!("[{}] crypt key reset failed: {e}", self.id);
    }
  }

  // Internals shared by the typed wrappers.

  fn set_data(&self, key: &str, data: &[u8], is_data_holder: bool) -> bool {
    if key.is_empty() {
      return false;
    }
    let mut inner = self.inner.lock();
    match inner.set_data(data, key, is_data_holder) {
      Ok(done) => done,
      Err(e) => {
        log::error!("[{}] failed to set value for key {key:?}: {e}", self.id);
        false
      },
    }
  }

  fn decode_scalar<T>(
    &self,
    key: &str,
    default: T,
    read: impl FnOnce(&mut CodedInput<'_>) -> Result<T>,
  ) -> T {
    if key.is_empty() {
      return default;
    }
    let mut inner = self.inner.lock();
    if let Err(e) = inner.check_load_data() {
      log::error!("[{}] load failed: {e}", self.id);
      return default;
    }
    let Some(data) = inner.value_bytes(key) else {
      return default;
    };
    if data.is_empty() {
      return default;
    }
    match read(&mut CodedInput::new(&data)) {
      Ok(value) => value,
      Err(e) => {
        log::error!("[{}] failed to decode value for key {key:?}: {e}", self.id);
        default
      },
    }
  }
}
