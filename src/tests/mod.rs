// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

mod encryption_test;
mod multi_instance_test;

use crate::Runtime;
use std::path::Path;

pub fn runtime(dir: &Path) -> Runtime {
  Runtime::new(dir).unwrap()
}

/// The write-back sequence, read straight from the on-disk sidecar layout.
pub fn sequence_on_disk(meta_path: &Path) -> u32 {
  let bytes = std::fs::read(meta_path).unwrap();
  u32::from_le_bytes(bytes[8 .. 12].try_into().unwrap())
}
