// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use md5::{Digest, Md5};
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Ids that cannot serve as file names are hashed and placed under this directory.
pub const SPECIAL_CHARACTER_DIRECTORY: &str = "specialCharacter";

const SPECIAL_CHARACTERS: [char; 9] = ['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
  let digest = Md5::digest(data);
  let mut hex = String::with_capacity(digest.len() * 2);
  for byte in digest {
    let _ = write!(hex, "{byte:02x}");
  }
  hex
}

#[must_use]
pub fn has_special_character(id: &str) -> bool {
  id.contains(SPECIAL_CHARACTERS)
}

fn encode_file_name(id: &str) -> PathBuf {
  if has_special_character(id) {
    Path::new(SPECIAL_CHARACTER_DIRECTORY).join(md5_hex(id.as_bytes()))
  } else {
    PathBuf::from(id)
  }
}

/// Data file path for `id` under `base`.
#[must_use]
pub fn data_path(base: &Path, id: &str) -> PathBuf {
  base.join(encode_file_name(id))
}

/// Sidecar meta path: the data path with `.crc` appended (not substituted, since ids may
/// contain dots).
#[must_use]
pub fn meta_path(data_path: &Path) -> PathBuf {
  let mut os = data_path.as_os_str().to_os_string();
  os.push(".crc");
  PathBuf::from(os)
}

/// Registry key for an instance: ids opened under a directory override get a hashed
/// composite key so equal ids in different directories stay distinct.
#[must_use]
pub fn instance_key(root: &Path, dir: Option<&Path>, id: &str) -> String {
  match dir {
    Some(dir) if dir != root => md5_hex(format!("{}/{id}", dir.display()).as_bytes()),
    _ => id.to_string(),
  }
}

#[cfg(test)]
#[path = "./paths_test.rs"]
mod tests;
