// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#![deny(
  clippy::expect_used,
  clippy::panic,
  clippy::todo,
  clippy::unimplemented,
  clippy::unreachable,
  clippy::unwrap_used
)]

#[cfg(test)]
mod tests;

pub mod coded;
pub mod crypter;
pub mod file_lock;
mod index;
pub mod memory_file;
pub mod meta;
mod paths;
pub mod runtime;
pub mod store;

pub use file_lock::LockMode;
pub use memory_file::SyncMode;
pub use runtime::{OpenOptions, Runtime};
pub use store::{Mode, Store};

//
// ErrorKind / RecoverStrategy
//

/// The recoverable error classes surfaced to a host-registered error handler during load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// The payload CRC did not match the sidecar digest.
  CrcCheckFail,
  /// The recorded payload length exceeds the data file.
  FileLength,
}

/// What the host wants done with a store that failed an integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverStrategy {
  /// Reset the store to empty.
  Discard,
  /// Keep whatever content is readable.
  Continue,
}

/// Handler invoked when a store fails an integrity check on load.
pub type ErrorHandler = dyn Fn(&str, ErrorKind) -> RecoverStrategy + Send + Sync;

/// Handler invoked with the store id whenever this process changes store content.
pub type ContentChangeHandler = dyn Fn(&str) + Send + Sync;

//
// Error
//

#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("store id must not be empty")]
  EmptyId,
  #[error("value decode failed: {0}")]
  Decode(String),
  #[error("crc mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
  CrcCheckFail { stored: u32, computed: u32 },
  #[error("actual size {actual_size} exceeds file size {file_size}")]
  FileLength { actual_size: usize, file_size: usize },
  #[error("cipher state mismatch: {0}")]
  Crypt(String),
}

pub type Result<T> = std::result::Result<T, Error>;
