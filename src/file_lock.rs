// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::Result;
use fs2::FileExt;
use std::fs::File;

/// Advisory lock modes. Readers take `Shared`, writers take `Exclusive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

//
// FileLock
//

/// Advisory whole-file lock with per-process recursion counting.
///
/// flock locks are held per open file description, not per thread, and do not nest; a
/// per-mode counter brackets every acquire/release so that re-entering `Shared` while
/// already holding `Exclusive` is a no-op and release is deferred to the outermost
/// holder. Upgrading `Shared -> Exclusive` converts the lock in place and downgrades
/// back when the exclusive count drains while shared holders remain.
///
/// When disabled (single-process stores) every operation is a no-op.
#[derive(Debug)]
pub struct FileLock {
  file: File,
  enabled: bool,
  shared_count: u32,
  exclusive_count: u32,
}

impl FileLock {
  #[must_use]
  pub fn new(file: File, enabled: bool) -> Self {
    Self {
      file,
      enabled,
      shared_count: 0,
      exclusive_count: 0,
    }
  }

  /// Acquire the lock in `mode`, blocking until available.
  ///
  /// # Errors
  /// Returns an error if the underlying flock call fails.
  pub fn lock(&mut self, mode: LockMode) -> Result<()> {
    if !self.enabled {
      return Ok(());
    }
    match mode {
      LockMode::Shared => {
        if self.shared_count == 0 && self.exclusive_count == 0 {
          FileExt::lock_shared(&self.file)?;
        }
        self.shared_count += 1;
      },
      LockMode::Exclusive => {
        if self.exclusive_count == 0 {
          // Converts an outstanding shared lock in place.
          FileExt::lock_exclusive(&self.file)?;
        }
        self.exclusive_count += 1;
      },
    }
    Ok(())
  }

  /// Acquire the lock in `mode` without blocking. Returns whether it was acquired.
  ///
  /// # Errors
  /// Returns an error if the underlying flock call fails for a reason other than
  /// contention.
  pub fn try_lock(&mut self, mode: LockMode) -> Result<bool> {
    if !self.enabled {
      return Ok(true);
    }
    match mode {
      LockMode::Shared => {
        if self.shared_count == 0 && self.exclusive_count == 0 {
          if let Err(e) = FileExt::try_lock_shared(&self.file) {
            return map_contention(e);
          }
        }
        self.shared_count += 1;
      },
      LockMode::Exclusive => {
        if self.exclusive_count == 0 {
          if let Err(e) = FileExt::try_lock_exclusive(&self.file) {
            return map_contention(e);
          }
        }
        self.exclusive_count += 1;
      },
    }
    Ok(true)
  }

  /// Release one level of the lock in `mode`. The flock is dropped (or downgraded back
  /// to shared) only when the outermost holder of that mode releases.
  pub fn unlock(&mut self, mode: LockMode) {
    if !self.enabled {
      return;
    }
    match mode {
      LockMode::Shared => {
        if self.shared_count == 0 {
          log::warn!("unbalanced shared unlock");
          return;
        }
        self.shared_count -= 1;
        if self.shared_count == 0 && self.exclusive_count == 0 {
          if let Err(e) = FileExt::unlock(&self.file) {
            log::error!("failed to release shared file lock: {e}");
          }
        }
      },
      LockMode::Exclusive => {
        if self.exclusive_count == 0 {
          log::warn!("unbalanced exclusive unlock");
          return;
        }
        self.exclusive_count -= 1;
        if self.exclusive_count == 0 {
          let result = if self.shared_count > 0 {
            // Outstanding shared holders: downgrade instead of releasing.
            FileExt::lock_shared(&self.file)
          } else {
            FileExt::unlock(&self.file)
          };
          if let Err(e) = result {
            log::error!("failed to release exclusive file lock: {e}");
          }
        }
      },
    }
  }
}

fn map_contention(e: std::io::Error) -> Result<bool> {
  if e.kind() == fs2::lock_contended_error().kind() {
    Ok(false)
  } else {
    Err(e.into())
  }
}

#[cfg(test)]
#[path = "./file_lock_test.rs"]
mod tests;
