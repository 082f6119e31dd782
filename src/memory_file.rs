// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::Result;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// How `msync` should flush dirty pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  Sync,
  Async,
}

/// The system page size. File sizes are always a multiple of this.
#[must_use]
pub fn page_size() -> usize {
  page_size::get()
}

/// Round `size` up to the next page multiple (at least one page).
#[must_use]
pub fn round_up_to_page(size: usize) -> usize {
  let page = page_size();
  let pages = size.div_ceil(page).max(1);
  pages * page
}

//
// MemoryFile
//

/// A file kept memory-mapped for its whole lifetime.
///
/// The mapping is replaced wholesale on every resize; on a failed resize the previous
/// mapping and size stay in effect.
#[derive(Debug)]
pub struct MemoryFile {
  path: PathBuf,
  file: File,
  mmap: MmapMut,
}

impl MemoryFile {
  /// Open (or create) `path` and map it read-write.
  ///
  /// The file is grown to at least `min_size`, rounded up to a page multiple; an existing
  /// larger file keeps its size. New bytes are zero-filled by the filesystem.
  ///
  /// # Errors
  /// Returns an error if the file cannot be created/opened or memory-mapped.
  pub fn open<P: AsRef<Path>>(path: P, min_size: usize) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)?;

    let min_size = round_up_to_page(min_size) as u64;
    let file_len = file.metadata()?.len();
    if file_len < min_size {
      file.set_len(min_size)?;
    }

    let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
    Ok(Self { path, file, mmap })
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.mmap.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.mmap.len() == 0
  }

  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  #[must_use]
  pub fn file(&self) -> &File {
    &self.file
  }

  #[must_use]
  pub fn as_slice(&self) -> &[u8] {
    &self.mmap
  }

  #[must_use]
  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.mmap
  }

  /// Grow the file so that at least `needed` bytes are mapped, in page multiples.
  /// No-op if the mapping is already large enough. The grown tail reads as zeros.
  ///
  /// # Errors
  /// Returns an error if the resize or remap fails; the previous mapping is kept.
  pub fn ensure_size(&mut self, needed: usize) -> Result<()> {
    if needed <= self.mmap.len() {
      return Ok(());
    }
    self.resize(round_up_to_page(needed))
  }

  /// Resize the file to exactly `new_size` rounded up to a page multiple and remap.
  /// Used by compaction to cap growth.
  ///
  /// # Errors
  /// Returns an error if the resize or remap fails; the previous mapping is kept.
  pub fn truncate(&mut self, new_size: usize) -> Result<()> {
    self.resize(round_up_to_page(new_size))
  }

  /// Re-query the file size and remap. Needed when a peer process resized the file
  /// behind our back.
  ///
  /// # Errors
  /// Returns an error if the remap fails; the previous mapping is kept.
  pub fn reload(&mut self) -> Result<()> {
    let file_len = usize::try_from(self.file.metadata()?.len()).unwrap_or(usize::MAX);
    if file_len == self.mmap.len() {
      return Ok(());
    }
    self.mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
    Ok(())
  }

  fn resize(&mut self, new_size: usize) -> Result<()> {
    self.file.set_len(new_size as u64)?;
    self.mmap = unsafe { MmapOptions::new().map_mut(&self.file)? };
    Ok(())
  }

  /// Flush dirty pages to disk.
  ///
  /// # Errors
  /// Returns an error if the msync fails.
  pub fn msync(&self, mode: SyncMode) -> Result<()> {
    match mode {
      SyncMode::Sync => self.mmap.flush()?,
      SyncMode::Async => self.mmap.flush_async()?,
    }
    Ok(())
  }
}

#[cfg(test)]
#[path = "./memory_file_test.rs"]
mod tests;
