// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! In-memory index from key to the live record location in the payload.
//!
//! Two shapes, one per store mode: plaintext entries are plain offsets into the mapping;
//! encrypted entries additionally carry the cipher state at the record's payload offset
//! (so a read decrypts one record, not the whole log) and an inline plaintext copy of
//! small values.

use crate::coded::varint;
use crate::crypter::CipherState;
use ahash::AHashMap;

/// Values no longer than this keep a plaintext copy inline in the encrypted index.
pub const SMALL_VALUE_CACHE_LIMIT: usize = 256;

fn record_size(key_size: u32, value_size: u32) -> usize {
  varint::compute_size(u64::from(key_size))
    + key_size as usize
    + varint::compute_size(u64::from(value_size))
    + value_size as usize
}

fn value_offset_in_record(key_size: u32, value_size: u32) -> usize {
  varint::compute_size(u64::from(key_size))
    + key_size as usize
    + varint::compute_size(u64::from(value_size))
}

//
// PlainEntry
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainEntry {
  /// Record start, relative to the payload (payload offset 0 is file offset 4).
  pub offset: u32,
  pub key_size: u32,
  pub value_size: u32,
}

impl PlainEntry {
  #[must_use]
  pub fn record_size(&self) -> usize {
    record_size(self.key_size, self.value_size)
  }

  /// Payload offset of the value bytes.
  #[must_use]
  pub fn value_offset(&self) -> usize {
    self.offset as usize + value_offset_in_record(self.key_size, self.value_size)
  }
}

//
// CryptEntry
//

#[derive(Debug, Clone)]
pub struct CryptEntry {
  pub offset: u32,
  pub key_size: u32,
  pub value_size: u32,
  /// Cipher state at `offset`, cloned to decrypt this record alone.
  pub cipher: CipherState,
  /// Plaintext value for small values, decoded once at write/load time.
  pub cache: Option<Vec<u8>>,
}

impl CryptEntry {
  #[must_use]
  pub fn record_size(&self) -> usize {
    record_size(self.key_size, self.value_size)
  }

  /// Offset of the value bytes within the record.
  #[must_use]
  pub fn value_offset_in_record(&self) -> usize {
    value_offset_in_record(self.key_size, self.value_size)
  }
}

//
// KeyIndex
//

pub enum KeyIndex {
  Plain(AHashMap<String, PlainEntry>),
  Crypt(AHashMap<String, CryptEntry>),
}

impl KeyIndex {
  #[must_use]
  pub fn new(encrypted: bool) -> Self {
    if encrypted {
      Self::Crypt(AHashMap::new())
    } else {
      Self::Plain(AHashMap::new())
    }
  }

  #[must_use]
  pub fn len(&self) -> usize {
    match self {
      Self::Plain(map) => map.len(),
      Self::Crypt(map) => map.len(),
    }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  #[must_use]
  pub fn contains(&self, key: &str) -> bool {
    match self {
      Self::Plain(map) => map.contains_key(key),
      Self::Crypt(map) => map.contains_key(key),
    }
  }

  #[must_use]
  pub fn keys(&self) -> Vec<String> {
    match self {
      Self::Plain(map) => map.keys().cloned().collect(),
      Self::Crypt(map) => map.keys().cloned().collect(),
    }
  }

  /// Remove `key`, reporting whether it was present.
  pub fn remove(&mut self, key: &str) -> bool {
    match self {
      Self::Plain(map) => map.remove(key).is_some(),
      Self::Crypt(map) => map.remove(key).is_some(),
    }
  }

  pub fn clear(&mut self) {
    match self {
      Self::Plain(map) => map.clear(),
      Self::Crypt(map) => map.clear(),
    }
  }

  /// Total payload bytes occupied by the live records.
  #[must_use]
  pub fn live_size(&self) -> usize {
    match self {
      Self::Plain(map) => map.values().map(PlainEntry::record_size).sum(),
      Self::Crypt(map) => map.values().map(CryptEntry::record_size).sum(),
    }
  }
}
