// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Streaming AES-CFB-128 over the payload byte stream.
//!
//! The crypter is positioned at a payload offset: encrypting or decrypting advances it.
//! A [`CipherState`] snapshot taken at a record boundary decrypts that one record without
//! replaying the stream from offset 0.

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::RngCore;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

fn pad_key(bytes: &[u8]) -> [u8; KEY_LEN] {
  let mut key = [0_u8; KEY_LEN];
  let len = bytes.len().min(KEY_LEN);
  key[.. len].copy_from_slice(&bytes[.. len]);
  key
}

//
// CipherState
//

/// Decryptor state frozen at a payload offset. Cloned per index entry; its only
/// operation is decrypting the bytes that follow that offset.
#[derive(Clone)]
pub struct CipherState(BufDecryptor<Aes128>);

impl CipherState {
  pub fn decrypt(&mut self, buf: &mut [u8]) {
    self.0.decrypt(buf);
  }
}

impl std::fmt::Debug for CipherState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("CipherState")
  }
}

//
// Crypter
//

/// AES-CFB-128 with a resettable IV.
///
/// Invariant: `enc` and `dec` sit at the same position of the same cipher stream; every
/// encrypt/decrypt call advances both, so a checkpoint taken before an append decrypts
/// the appended record.
pub struct Crypter {
  key: [u8; KEY_LEN],
  iv: [u8; IV_LEN],
  enc: BufEncryptor<Aes128>,
  dec: BufDecryptor<Aes128>,
}

impl Crypter {
  /// Create a crypter from raw key bytes, zero-padded or truncated to 16 bytes.
  /// Without an explicit IV the key doubles as the IV (the pre-random-IV layout).
  #[must_use]
  pub fn new(key_bytes: &[u8], iv: Option<[u8; IV_LEN]>) -> Self {
    let key = pad_key(key_bytes);
    let iv = iv.unwrap_or(key);
    Self {
      key,
      iv,
      enc: BufEncryptor::new(&key.into(), &iv.into()),
      dec: BufDecryptor::new(&key.into(), &iv.into()),
    }
  }

  #[must_use]
  pub fn key(&self) -> &[u8; KEY_LEN] {
    &self.key
  }

  #[must_use]
  pub fn iv(&self) -> [u8; IV_LEN] {
    self.iv
  }

  /// Whether `key_bytes` pads to the configured key.
  #[must_use]
  pub fn matches_key(&self, key_bytes: &[u8]) -> bool {
    self.key == pad_key(key_bytes)
  }

  #[must_use]
  pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0_u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
  }

  /// Rewind the stream to offset 0 under `iv` (or the current default).
  pub fn reset_iv(&mut self, iv: Option<&[u8; IV_LEN]>) {
    if let Some(iv) = iv {
      self.iv = *iv;
    }
    self.enc = BufEncryptor::new(&self.key.into(), &self.iv.into());
    self.dec = BufDecryptor::new(&self.key.into(), &self.iv.into());
  }

  /// Encrypt `buf` in place, advancing the stream by `buf.len()` bytes.
  pub fn encrypt(&mut self, buf: &mut [u8]) {
    self.enc.encrypt(buf);
    let mut shadow = buf.to_vec();
    self.dec.decrypt(&mut shadow);
  }

  /// Decrypt `buf` in place, advancing the stream by `buf.len()` bytes.
  pub fn decrypt(&mut self, buf: &mut [u8]) {
    self.dec.decrypt(buf);
    let mut shadow = buf.to_vec();
    self.enc.encrypt(&mut shadow);
  }

  /// Snapshot the decryptor at the current stream position.
  #[must_use]
  pub fn checkpoint(&self) -> CipherState {
    CipherState(self.dec.clone())
  }
}

#[cfg(test)]
#[path = "./crypter_test.rs"]
mod tests;
