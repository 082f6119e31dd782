// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::{MetaInfo, VERSION_RANDOM_IV, VERSION_SEQUENCE};
use pretty_assertions::assert_eq;

#[test]
fn round_trip() {
  let meta = MetaInfo {
    crc_digest: 0xdead_beef,
    version: VERSION_SEQUENCE,
    sequence: 42,
    iv: [1; 16],
    backup_iv: [2; 16],
  };

  let mut buf = [0_u8; MetaInfo::ENCODED_LEN];
  meta.write(&mut buf);
  assert_eq!(MetaInfo::read(&buf), meta);
}

#[test]
fn zero_page_reads_as_fresh() {
  let page = [0_u8; 4096];
  let meta = MetaInfo::read(&page);
  assert_eq!(meta, MetaInfo::default());
  assert_eq!(meta.version, 0);
  assert!(!meta.has_iv());
}

#[test]
fn short_buffer_reads_as_fresh() {
  assert_eq!(MetaInfo::read(&[1, 2, 3]), MetaInfo::default());
}

#[test]
fn layout_is_packed_little_endian() {
  let meta = MetaInfo {
    crc_digest: 0x0403_0201,
    version: VERSION_RANDOM_IV,
    sequence: 7,
    iv: [0xaa; 16],
    backup_iv: [0xbb; 16],
  };

  let mut buf = [0_u8; MetaInfo::ENCODED_LEN];
  meta.write(&mut buf);
  assert_eq!(&buf[.. 4], &[1, 2, 3, 4]);
  assert_eq!(&buf[4 .. 8], &[2, 0, 0, 0]);
  assert_eq!(&buf[8 .. 12], &[7, 0, 0, 0]);
  assert_eq!(&buf[12 .. 28], &[0xaa; 16]);
  assert_eq!(&buf[28 .. 44], &[0xbb; 16]);
}

#[test]
fn iv_presence_follows_version() {
  let mut meta = MetaInfo {
    version: 1,
    ..MetaInfo::default()
  };
  assert!(!meta.has_iv());
  meta.version = VERSION_RANDOM_IV;
  assert!(meta.has_iv());
  meta.version = VERSION_SEQUENCE;
  assert!(meta.has_iv());
}
