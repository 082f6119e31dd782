// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! The I/O core: loading the mapped log, appending records, compacting, and keeping the
//! sidecar meta in step.
//!
//! Crash-safety ordering on every append: record bytes first, then the `actual_size`
//! header at offset 0, then the meta CRC. Records are self-delimited, so a reader under
//! the shared lock sees either the old payload or the new one, never a torn record.

use crate::coded::{self, varint, CodedInput, CodedOutput};
use crate::crypter::Crypter;
use crate::file_lock::{FileLock, LockMode};
use crate::index::{CryptEntry, KeyIndex, PlainEntry, SMALL_VALUE_CACHE_LIMIT};
use crate::memory_file::{self, MemoryFile, SyncMode};
use crate::meta::{MetaInfo, IV_LEN, VERSION_SEQUENCE};
use crate::runtime::Handlers;
use crate::{Error, ErrorKind, RecoverStrategy, Result};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

/// Width of the `actual_size` header at the start of the data file.
pub(crate) const FIXED32_SIZE: usize = 4;

/// Whether a meta write bumps the write-back sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SequenceUpdate {
  Keep,
  Increase,
}

/// One record parsed out of a plaintext payload slice.
struct RawRecord {
  key_start: usize,
  key_end: usize,
  value_size: u32,
  record_len: usize,
}

fn parse_record(buf: &[u8]) -> Result<RawRecord> {
  let mut input = CodedInput::new(buf);
  let key = input.read_data()?;
  if key.is_empty() {
    return Err(Error::Decode("record with empty key".to_string()));
  }
  let key_end = input.position();
  let key_start = key_end - key.len();
  let value = input.read_data()?;
  #[allow(clippy::cast_possible_truncation)]
  Ok(RawRecord {
    key_start,
    key_end,
    value_size: value.len() as u32,
    record_len: input.position(),
  })
}

//
// StoreInner
//

pub(crate) struct StoreInner {
  id: String,
  file: MemoryFile,
  meta_file: MemoryFile,
  meta: MetaInfo,
  file_lock: FileLock,
  crypter: Option<Crypter>,
  index: KeyIndex,
  actual_size: usize,
  crc_digest: u32,
  need_load_from_file: bool,
  multi_process: bool,
  handlers: Arc<Handlers>,
}

impl StoreInner {
  pub fn open(
    id: &str,
    data_path: &Path,
    meta_path: &Path,
    multi_process: bool,
    crypt_key: Option<&[u8]>,
    handlers: Arc<Handlers>,
  ) -> Result<Self> {
    let file = MemoryFile::open(data_path, memory_file::page_size())?;
    let meta_file = MemoryFile::open(meta_path, memory_file::page_size())?;
    let lock_file = meta_file.file().try_clone()?;
    let crypter = crypt_key.map(|key| Crypter::new(key, None));

    let mut inner = Self {
      id: id.to_string(),
      index: KeyIndex::new(crypter.is_some()),
      file,
      meta_file,
      meta: MetaInfo::default(),
      file_lock: FileLock::new(lock_file, multi_process),
      crypter,
      actual_size: 0,
      crc_digest: 0,
      need_load_from_file: true,
      multi_process,
      handlers,
    };

    // Sensitive zone: peers may be appending while we map and parse.
    inner.file_lock.lock(LockMode::Shared)?;
    let loaded = inner.check_load_data();
    inner.file_lock.unlock(LockMode::Shared);
    loaded?;

    Ok(inner)
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn is_file_valid(&self) -> bool {
    !self.file.is_empty()
  }

  pub fn actual_size(&self) -> usize {
    self.actual_size
  }

  pub fn total_size(&self) -> usize {
    self.file.len()
  }

  pub fn index(&self) -> &KeyIndex {
    &self.index
  }

  pub fn crypt_key(&self) -> Option<Vec<u8>> {
    self.crypter.as_ref().map(|crypter| {
      let key = crypter.key();
      let len = key.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
      key[.. len].to_vec()
    })
  }

  // Loading.

  /// Ensure in-memory state matches the file. Reloads when a peer process appended
  /// (`actual_size` moved) or rewrote (`sequence` moved) the store.
  pub fn check_load_data(&mut self) -> Result<()> {
    if self.need_load_from_file {
      self.need_load_from_file = false;
      return self.load_from_file();
    }
    if !self.multi_process {
      return Ok(());
    }

    let on_disk = MetaInfo::read(self.meta_file.as_slice());
    if on_disk.sequence != self.meta.sequence {
      log::info!("[{}] rewritten by peer (sequence {} -> {}), reloading", self.id, self.meta.sequence, on_disk.sequence);
      return self.reload_after_peer_change();
    }
    if self.read_actual_size_header() != self.actual_size {
      log::info!("[{}] appended by peer, reloading", self.id);
      return self.reload_after_peer_change();
    }
    Ok(())
  }

  fn reload_after_peer_change(&mut self) -> Result<()> {
    // The peer may have grown the data file, so the mapping must be refreshed too.
    self.file.reload()?;
    self.load_from_file()
  }

  fn load_from_file(&mut self) -> Result<()> {
    self.meta = MetaInfo::read(self.meta_file.as_slice());
    self.actual_size = self.read_actual_size_header();
    self.crc_digest = 0;
    self.index = KeyIndex::new(self.crypter.is_some());

    let file_size = self.file.len();
    let mut discard = false;

    if FIXED32_SIZE + self.actual_size > file_size {
      log::error!(
        "[{}] actual size {} exceeds file size {file_size}",
        self.id,
        self.actual_size
      );
      match self.handlers.on_error(&self.id, ErrorKind::FileLength) {
        RecoverStrategy::Discard => discard = true,
        RecoverStrategy::Continue => self.actual_size = file_size - FIXED32_SIZE,
      }
    }

    if !discard {
      let payload = &self.file.as_slice()[FIXED32_SIZE .. FIXED32_SIZE + self.actual_size];
      let computed = crc32fast::hash(payload);
      if computed == self.meta.crc_digest {
        self.crc_digest = computed;
      } else {
        log::error!(
          "[{}] crc check failed, stored 0x{:08x}, computed 0x{computed:08x}",
          self.id,
          self.meta.crc_digest
        );
        match self.handlers.on_error(&self.id, ErrorKind::CrcCheckFail) {
          RecoverStrategy::Discard => discard = true,
          RecoverStrategy::Continue => self.crc_digest = computed,
        }
      }
    }

    if discard {
      return self.reset_to_empty();
    }

    let consumed = if self.crypter.is_some() {
      self.init_fresh_iv_if_needed();
      self.walk_crypt()
    } else {
      self.walk_plain()
    };

    // A payload the CRC accepted but the walk could not finish: either a hash collision
    // over garbage or (for encrypted stores) a wrong key. Same handler, same choices.
    if consumed < self.actual_size {
      log::error!(
        "[{}] could not parse payload past offset {consumed} of {}",
        self.id,
        self.actual_size
      );
      match self.handlers.on_error(&self.id, ErrorKind::CrcCheckFail) {
        RecoverStrategy::Discard => return self.reset_to_empty(),
        RecoverStrategy::Continue => {
          // Keep the parseable prefix; appends continue from there.
          self.actual_size = consumed;
          self.crc_digest = crc32fast::hash(
            &self.file.as_slice()[FIXED32_SIZE .. FIXED32_SIZE + consumed],
          );
          self.write_actual_size_header(consumed);
          self.write_meta(None, SequenceUpdate::Keep);
        },
      }
    }

    log::info!(
      "[{}] loaded, {} keys, actual size {}, file size {file_size}",
      self.id,
      self.index.len(),
      self.actual_size
    );
    Ok(())
  }

  /// A brand-new encrypted store gets a random IV before the first byte is encrypted.
  fn init_fresh_iv_if_needed(&mut self) {
    if self.actual_size == 0 && !self.meta.has_iv() {
      let iv = Crypter::random_iv();
      if let Some(crypter) = &mut self.crypter {
        crypter.reset_iv(Some(&iv));
      }
      self.write_meta(Some(&iv), SequenceUpdate::Keep);
    }
  }

  /// Walk the plaintext log, applying last-writer-wins. Returns how many payload bytes
  /// parsed cleanly.
  fn walk_plain(&mut self) -> usize {
    let payload = &self.file.as_slice()[FIXED32_SIZE .. FIXED32_SIZE + self.actual_size];
    let KeyIndex::Plain(map) = &mut self.index else {
      return 0;
    };

    let mut pos = 0;
    while pos < payload.len() {
      let record = match parse_record(&payload[pos ..]) {
        Ok(record) => record,
        Err(e) => {
          log::warn!("malformed record at payload offset {pos}: {e}");
          break;
        },
      };
      let key_bytes = &payload[pos + record.key_start .. pos + record.key_end];
      let Ok(key) = std::str::from_utf8(key_bytes) else {
        log::warn!("non-utf8 key at payload offset {pos}");
        break;
      };

      #[allow(clippy::cast_possible_truncation)]
      if record.value_size == 0 {
        map.remove(key);
      } else {
        map.insert(
          key.to_string(),
          PlainEntry {
            offset: pos as u32,
            key_size: key_bytes.len() as u32,
            value_size: record.value_size,
          },
        );
      }
      pos += record.record_len;
    }
    pos
  }

  /// Walk the encrypted log, checkpointing the cipher state at each record so reads can
  /// decrypt one record in isolation. Returns how many payload bytes parsed cleanly and
  /// leaves the main crypter positioned at that offset.
  fn walk_crypt(&mut self) -> usize {
    let Some(crypter) = &mut self.crypter else {
      return 0;
    };
    let iv = if self.meta.has_iv() { Some(self.meta.iv) } else { None };
    crypter.reset_iv(iv.as_ref());
    let zero_state = crypter.checkpoint();

    let cipher_payload =
      self.file.as_slice()[FIXED32_SIZE .. FIXED32_SIZE + self.actual_size].to_vec();
    let mut plain = cipher_payload.clone();
    {
      let mut probe = zero_state.clone();
      probe.decrypt(&mut plain);
    }
    let mut replay = zero_state;

    let KeyIndex::Crypt(map) = &mut self.index else {
      return 0;
    };

    let mut pos = 0;
    while pos < plain.len() {
      let record = match parse_record(&plain[pos ..]) {
        Ok(record) => record,
        Err(e) => {
          log::warn!("malformed record at payload offset {pos}: {e}");
          break;
        },
      };
      let key_bytes = &plain[pos + record.key_start .. pos + record.key_end];
      let Ok(key) = std::str::from_utf8(key_bytes) else {
        log::warn!("non-utf8 key at payload offset {pos}");
        break;
      };

      let checkpoint = replay.clone();
      let mut advanced = cipher_payload[pos .. pos + record.record_len].to_vec();
      replay.decrypt(&mut advanced);

      #[allow(clippy::cast_possible_truncation)]
      if record.value_size == 0 {
        map.remove(key);
      } else {
        let value_start = pos + record.record_len - record.value_size as usize;
        let cache = (record.value_size as usize <= SMALL_VALUE_CACHE_LIMIT)
          .then(|| plain[value_start .. pos + record.record_len].to_vec());
        map.insert(
          key.to_string(),
          CryptEntry {
            offset: pos as u32,
            key_size: key_bytes.len() as u32,
            value_size: record.value_size,
            cipher: checkpoint,
            cache,
          },
        );
      }
      pos += record.record_len;
    }

    // Position the append stream at the parsed prefix.
    let mut scratch = cipher_payload[.. pos].to_vec();
    crypter.decrypt(&mut scratch);
    pos
  }

  fn reset_to_empty(&mut self) -> Result<()> {
    log::warn!("[{}] discarding content, resetting to empty", self.id);
    self.index.clear();
    self.actual_size = 0;
    self.crc_digest = 0;
    self.write_actual_size_header(0);

    let mut iv = None;
    if let Some(crypter) = &mut self.crypter {
      let fresh = Crypter::random_iv();
      crypter.reset_iv(Some(&fresh));
      iv = Some(fresh);
    }
    self.write_meta(iv.as_ref(), SequenceUpdate::Increase);
    Ok(())
  }

  // Header and meta bookkeeping.

  fn read_actual_size_header(&self) -> usize {
    let slice = self.file.as_slice();
    if slice.len() < FIXED32_SIZE {
      return 0;
    }
    let mut bytes = [0_u8; FIXED32_SIZE];
    bytes.copy_from_slice(&slice[.. FIXED32_SIZE]);
    u32::from_le_bytes(bytes) as usize
  }

  #[allow(clippy::cast_possible_truncation)]
  fn write_actual_size_header(&mut self, size: usize) {
    let bytes = (size as u32).to_le_bytes();
    self.file.as_mut_slice()[.. FIXED32_SIZE].copy_from_slice(&bytes);
  }

  fn write_meta(&mut self, iv: Option<&[u8; IV_LEN]>, update: SequenceUpdate) {
    self.meta.crc_digest = self.crc_digest;
    self.meta.version = VERSION_SEQUENCE;
    if update == SequenceUpdate::Increase {
      self.meta.sequence = self.meta.sequence.wrapping_add(1);
    }
    if let Some(iv) = iv {
      self.meta.iv = *iv;
    }
    self.meta.write(self.meta_file.as_mut_slice());
  }

  // Write path.

  /// Append one key/value record. With `is_data_holder`, `data` is raw content that
  /// receives its own length prefix inside the value (strings, byte buffers); otherwise
  /// `data` is a pre-encoded scalar.
  pub fn set_data(&mut self, data: &[u8], key: &str, is_data_holder: bool) -> Result<bool> {
    self.file_lock.lock(LockMode::Exclusive)?;
    let result = self.append_record(key, data, is_data_holder, false);
    self.file_lock.unlock(LockMode::Exclusive);
    result?;
    self.handlers.notify_content_changed(&self.id);
    Ok(true)
  }

  /// Append a tombstone for `key` if present, erasing it from the index.
  pub fn remove_data(&mut self, key: &str) -> Result<bool> {
    self.file_lock.lock(LockMode::Exclusive)?;
    let result: Result<bool> = (|| {
      self.check_load_data()?;
      if !self.index.contains(key) {
        return Ok(false);
      }
      self.append_record(key, &[], false, true)?;
      Ok(true)
    })();
    self.file_lock.unlock(LockMode::Exclusive);
    let removed = result?;
    if removed {
      self.handlers.notify_content_changed(&self.id);
    }
    Ok(removed)
  }

  /// Erase several keys and compact in one pass.
  pub fn remove_multiple(&mut self, keys: &[String]) -> Result<usize> {
    self.file_lock.lock(LockMode::Exclusive)?;
    let result: Result<usize> = (|| {
      self.check_load_data()?;
      let removed = keys.iter().filter(|key| self.index.remove(key)).count();
      if removed > 0 {
        self.full_write_back()?;
      }
      Ok(removed)
    })();
    self.file_lock.unlock(LockMode::Exclusive);
    let removed = result?;
    if removed > 0 {
      self.handlers.notify_content_changed(&self.id);
    }
    Ok(removed)
  }

  fn append_record(
    &mut self,
    key: &str,
    data: &[u8],
    is_data_holder: bool,
    tombstone: bool,
  ) -> Result<()> {
    self.check_load_data()?;

    let key_bytes = key.as_bytes();
    let value_size = if is_data_holder {
      coded::data_size(data.len())
    } else {
      data.len()
    };
    let record_size =
      coded::data_size(key_bytes.len()) + varint::compute_size(value_size as u64) + value_size;

    self.ensure_space(record_size)?;

    let offset = self.actual_size;
    let start = FIXED32_SIZE + offset;
    {
      let buf = &mut self.file.as_mut_slice()[start .. start + record_size];
      let mut output = CodedOutput::new(buf);
      output.write_data(key_bytes)?;
      output.write_raw_varint64(value_size as u64)?;
      if is_data_holder {
        output.write_data(data)?;
      } else {
        output.write_raw_bytes(data)?;
      }
      debug_assert_eq!(output.position(), record_size);
    }

    #[allow(clippy::cast_possible_truncation)]
    match &mut self.index {
      KeyIndex::Plain(map) => {
        if tombstone {
          map.remove(key);
        } else {
          map.insert(
            key.to_string(),
            PlainEntry {
              offset: offset as u32,
              key_size: key_bytes.len() as u32,
              value_size: value_size as u32,
            },
          );
        }
      },
      KeyIndex::Crypt(map) => {
        let crypter = self
          .crypter
          .as_mut()
          .ok_or_else(|| Error::Crypt("encrypted index without a crypter".to_string()))?;
        let checkpoint = crypter.checkpoint();
        let cache = (!tombstone && value_size <= SMALL_VALUE_CACHE_LIMIT).then(|| {
          self.file.as_slice()[start + record_size - value_size .. start + record_size].to_vec()
        });
        crypter.encrypt(&mut self.file.as_mut_slice()[start .. start + record_size]);
        if tombstone {
          map.remove(key);
        } else {
          map.insert(
            key.to_string(),
            CryptEntry {
              offset: offset as u32,
              key_size: key_bytes.len() as u32,
              value_size: value_size as u32,
              cipher: checkpoint,
              cache,
            },
          );
        }
      },
    }

    // Publish: bytes are in place, now the header, then the digest.
    let mut hasher = crc32fast::Hasher::new_with_initial(self.crc_digest);
    hasher.update(&self.file.as_slice()[start .. start + record_size]);
    self.crc_digest = hasher.finalize();
    self.actual_size += record_size;
    self.write_actual_size_header(self.actual_size);
    self.write_meta(None, SequenceUpdate::Keep);
    Ok(())
  }

  /// Make room for `record_size` more payload bytes: compact if the live set fits the
  /// current file, otherwise double the file (page multiples) until it does, then
  /// compact anyway so the new tail is contiguous.
  fn ensure_space(&mut self, record_size: usize) -> Result<()> {
    if FIXED32_SIZE + self.actual_size + record_size <= self.file.len() {
      return Ok(());
    }

    let needed = FIXED32_SIZE + self.index.live_size() + record_size;
    if needed > self.file.len() {
      let mut new_size = self.file.len().max(memory_file::page_size());
      while new_size < needed {
        new_size = new_size.saturating_mul(2);
      }
      log::info!(
        "[{}] growing file {} -> {new_size}",
        self.id,
        self.file.len()
      );
      self.file.ensure_size(new_size)?;
    } else {
      log::info!("[{}] compacting to reclaim space", self.id);
    }
    self.full_write_back()
  }

  // Compaction.

  /// Rewrite the file to contain exactly the live set. Bumps the sequence so peers
  /// reload.
  pub fn full_write_back(&mut self) -> Result<()> {
    let pairs = self.collect_live_values();
    self.rewrite_all(pairs)
  }

  /// The live set as plaintext `(key, value_bytes)` pairs.
  fn collect_live_values(&self) -> Vec<(String, Vec<u8>)> {
    match &self.index {
      KeyIndex::Plain(map) => map
        .iter()
        .map(|(key, entry)| {
          let start = FIXED32_SIZE + entry.value_offset();
          let value = self.file.as_slice()[start .. start + entry.value_size as usize].to_vec();
          (key.clone(), value)
        })
        .collect(),
      KeyIndex::Crypt(map) => map
        .iter()
        .map(|(key, entry)| (key.clone(), self.decrypt_value(entry)))
        .collect(),
    }
  }

  fn decrypt_value(&self, entry: &CryptEntry) -> Vec<u8> {
    if let Some(cache) = &entry.cache {
      return cache.clone();
    }
    let start = FIXED32_SIZE + entry.offset as usize;
    let mut record = self.file.as_slice()[start .. start + entry.record_size()].to_vec();
    let mut state = entry.cipher.clone();
    state.decrypt(&mut record);
    record[entry.value_offset_in_record() ..].to_vec()
  }

  /// Serialize `pairs` as a fresh payload, encrypt under a new IV when configured, and
  /// swap it in. Used by compaction, rekeying, and bulk removal.
  fn rewrite_all(&mut self, pairs: Vec<(String, Vec<u8>)>) -> Result<()> {
    let total: usize = pairs
      .iter()
      .map(|(key, value)| {
        coded::data_size(key.len()) + varint::compute_size(value.len() as u64) + value.len()
      })
      .sum();
    self.file.ensure_size(FIXED32_SIZE + total)?;

    let mut buffer = vec![0_u8; total];
    let mut layouts = Vec::with_capacity(pairs.len());
    {
      let mut output = CodedOutput::new(&mut buffer);
      for (key, value) in &pairs {
        let offset = output.position();
        output.write_data(key.as_bytes())?;
        output.write_raw_varint64(value.len() as u64)?;
        output.write_raw_bytes(value)?;
        layouts.push((offset, output.position() - offset));
      }
    }

    let old_actual_size = self.actual_size;

    #[allow(clippy::cast_possible_truncation)]
    if let Some(crypter) = &mut self.crypter {
      // Stash the new IV as the backup first, so an interrupted write-back can be
      // diagnosed on the next load.
      let iv = Crypter::random_iv();
      self.meta.backup_iv = iv;
      self.meta.write(self.meta_file.as_mut_slice());

      crypter.reset_iv(Some(&iv));
      let KeyIndex::Crypt(map) = &mut self.index else {
        return Err(Error::Crypt("encrypted store with plaintext index".to_string()));
      };
      map.clear();
      for ((key, value), (offset, record_len)) in pairs.iter().zip(&layouts) {
        let checkpoint = crypter.checkpoint();
        let cache = (value.len() <= SMALL_VALUE_CACHE_LIMIT).then(|| value.clone());
        crypter.encrypt(&mut buffer[*offset .. offset + record_len]);
        map.insert(
          key.clone(),
          CryptEntry {
            offset: *offset as u32,
            key_size: key.len() as u32,
            value_size: value.len() as u32,
            cipher: checkpoint,
            cache,
          },
        );
      }
    } else {
      let KeyIndex::Plain(map) = &mut self.index else {
        return Err(Error::Crypt("plaintext store with encrypted index".to_string()));
      };
      map.clear();
      for ((key, value), (offset, _)) in pairs.iter().zip(&layouts) {
        map.insert(
          key.clone(),
          PlainEntry {
            offset: *offset as u32,
            key_size: key.len() as u32,
            value_size: value.len() as u32,
          },
        );
      }
    }

    let slice = self.file.as_mut_slice();
    slice[FIXED32_SIZE .. FIXED32_SIZE + total].copy_from_slice(&buffer);
    if old_actual_size > total {
      slice[FIXED32_SIZE + total .. FIXED32_SIZE + old_actual_size].fill(0);
    }

    self.actual_size = total;
    self.crc_digest = crc32fast::hash(&self.file.as_slice()[FIXED32_SIZE .. FIXED32_SIZE + total]);
    self.write_actual_size_header(total);
    let iv = self.crypter.as_ref().map(Crypter::iv);
    self.write_meta(iv.as_ref(), SequenceUpdate::Increase);

    log::info!(
      "[{}] full write-back done, {} keys, actual size {total}",
      self.id,
      self.index.len()
    );
    Ok(())
  }

  // Read path.

  /// The live value bytes for `key`: a view into the mapping in plaintext mode, a
  /// decrypted copy (or the inline cache) in encrypted mode.
  pub fn value_bytes(&self, key: &str) -> Option<Cow<'_, [u8]>> {
    match &self.index {
      KeyIndex::Plain(map) => {
        let entry = map.get(key)?;
        let start = FIXED32_SIZE + entry.value_offset();
        Some(Cow::Borrowed(
          &self.file.as_slice()[start .. start + entry.value_size as usize],
        ))
      },
      KeyIndex::Crypt(map) => {
        let entry = map.get(key)?;
        if let Some(cache) = &entry.cache {
          return Some(Cow::Borrowed(cache));
        }
        Some(Cow::Owned(self.decrypt_value(entry)))
      },
    }
  }

  // Maintenance.

  /// Reset to an empty store: one-page file, fresh IV, bumped sequence.
  pub fn clear_all(&mut self) -> Result<()> {
    self.file_lock.lock(LockMode::Exclusive)?;
    let result: Result<()> = (|| {
      self.check_load_data()?;
      self.file.truncate(memory_file::page_size())?;
      self.reset_to_empty()?;
      self.file.msync(SyncMode::Sync)?;
      self.meta_file.msync(SyncMode::Sync)?;
      Ok(())
    })();
    self.file_lock.unlock(LockMode::Exclusive);
    result?;
    self.handlers.notify_content_changed(&self.id);
    Ok(())
  }

  /// Drop all in-memory state; the next operation reloads from the mapping.
  pub fn clear_memory_cache(&mut self) {
    if self.need_load_from_file {
      return;
    }
    log::info!("[{}] clearing memory cache", self.id);
    self.need_load_from_file = true;
    self.index.clear();
    self.actual_size = 0;
    self.crc_digest = 0;
    if let Some(crypter) = &mut self.crypter {
      let iv = self.meta.has_iv().then_some(self.meta.iv);
      crypter.reset_iv(iv.as_ref());
    }
  }

  pub fn sync(&mut self, mode: SyncMode) -> Result<()> {
    if self.need_load_from_file || !self.is_file_valid() {
      return Ok(());
    }
    self.file_lock.lock(LockMode::Exclusive)?;
    let result = self
      .file
      .msync(mode)
      .and_then(|()| self.meta_file.msync(mode));
    self.file_lock.unlock(LockMode::Exclusive);
    result
  }

  // Key management.

  /// Re-encrypt (or decrypt) the whole file under a new key via a full write-back.
  pub fn rekey(&mut self, new_key: Option<&[u8]>) -> Result<()> {
    self.file_lock.lock(LockMode::Exclusive)?;
    let result: Result<()> = (|| {
      self.check_load_data()?;
      match (&self.crypter, new_key) {
        (Some(crypter), Some(key)) if crypter.matches_key(key) => Ok(()),
        (None, None) => Ok(()),
        _ => {
          log::info!(
            "[{}] rekeying, encrypted {} -> {}",
            self.id,
            self.crypter.is_some(),
            new_key.is_some()
          );
          let pairs = self.collect_live_values();
          self.crypter = new_key.map(|key| Crypter::new(key, None));
          self.index = KeyIndex::new(self.crypter.is_some());
          self.rewrite_all(pairs)
        },
      }
    })();
    self.file_lock.unlock(LockMode::Exclusive);
    result?;
    self.handlers.notify_content_changed(&self.id);
    Ok(())
  }

  /// Swap the in-memory key without rewriting the file, for stores whose on-disk
  /// content was already rekeyed by a peer. Forces a reload under the new key.
  pub fn check_re_set_crypt_key(&mut self, new_key: Option<&[u8]>) -> Result<()> {
    match (&self.crypter, new_key) {
      (Some(crypter), Some(key)) if crypter.matches_key(key) => Ok(()),
      (None, None) => Ok(()),
      _ => {
        log::info!("[{}] resetting crypt key in memory", self.id);
        self.crypter = new_key.map(|key| Crypter::new(key, None));
        self.index = KeyIndex::new(self.crypter.is_some());
        self.need_load_from_file = true;
        self.check_load_data()
      },
    }
  }

  // Manual cross-process locking.

  pub fn process_lock(&mut self) -> Result<()> {
    self.file_lock.lock(LockMode::Exclusive)
  }

  pub fn process_unlock(&mut self) {
    self.file_lock.unlock(LockMode::Exclusive);
  }

  pub fn try_process_lock(&mut self) -> Result<bool> {
    self.file_lock.try_lock(LockMode::Exclusive)
  }
}
