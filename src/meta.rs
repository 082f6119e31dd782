// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Sidecar meta record, stored in the one-page `*.crc` file next to the data file.
//!
//! Packed little-endian layout, fixed for on-disk compatibility:
//! ```text
//! crc_digest : u32
//! version    : u32        // 1, 2, or 3
//! sequence   : u32        // v3+
//! iv         : u8[16]     // v2+
//! backup_iv  : u8[16]     // v3+
//! ```
//! The rest of the page is zero. Readers of a zero page see version 0, which marks a
//! freshly created store.

use bytes::{Buf, BufMut};

/// Original layout: size and CRC only.
pub const VERSION_BASE: u32 = 1;
/// Adds the random AES-CFB IV.
pub const VERSION_RANDOM_IV: u32 = 2;
/// Adds the write-back sequence and backup IV.
pub const VERSION_SEQUENCE: u32 = 3;

pub const IV_LEN: usize = 16;

//
// MetaInfo
//

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaInfo {
  pub crc_digest: u32,
  pub version: u32,
  pub sequence: u32,
  pub iv: [u8; IV_LEN],
  pub backup_iv: [u8; IV_LEN],
}

impl MetaInfo {
  pub const ENCODED_LEN: usize = 4 + 4 + 4 + IV_LEN + IV_LEN;

  /// Decode from the head of `buf`. A buffer shorter than the full layout (including an
  /// all-zero fresh page) decodes to the default record.
  #[must_use]
  pub fn read(buf: &[u8]) -> Self {
    if buf.len() < Self::ENCODED_LEN {
      return Self::default();
    }
    let mut cursor = buf;
    let mut meta = Self {
      crc_digest: cursor.get_u32_le(),
      version: cursor.get_u32_le(),
      sequence: cursor.get_u32_le(),
      ..Self::default()
    };
    cursor.copy_to_slice(&mut meta.iv);
    cursor.copy_to_slice(&mut meta.backup_iv);
    meta
  }

  /// Encode into the head of `buf`, which must hold at least `ENCODED_LEN` bytes.
  pub fn write(&self, buf: &mut [u8]) {
    debug_assert!(buf.len() >= Self::ENCODED_LEN);
    let mut cursor = buf;
    cursor.put_u32_le(self.crc_digest);
    cursor.put_u32_le(self.version);
    cursor.put_u32_le(self.sequence);
    cursor.put_slice(&self.iv);
    cursor.put_slice(&self.backup_iv);
  }

  /// Whether the record carries a usable random IV.
  #[must_use]
  pub fn has_iv(&self) -> bool {
    self.version >= VERSION_RANDOM_IV
  }
}

#[cfg(test)]
#[path = "./meta_test.rs"]
mod tests;
