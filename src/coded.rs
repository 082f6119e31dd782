// pagekv - memory-mapped key-value storage
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

//! Scalar encode/decode over a byte cursor.
//!
//! Values use protobuf scalar encodings: varints for integers and bools (signed values
//! sign-extend to 64 bits before encoding), little-endian fixed widths for floats, and
//! `varint(len) || bytes` for length-prefixed payloads. Every encoded size is computable
//! up front so callers can allocate exactly once.

use crate::{Error, Result};
use bytes::{Buf, BufMut};

pub mod varint {
  /// Maximum varint size for u64 (10 bytes)
  pub const MAX_SIZE: usize = 10;

  /// Calculate the size of a u64 when encoded as a varint.
  #[allow(clippy::cast_possible_truncation)]
  #[must_use]
  pub fn compute_size(value: u64) -> usize {
    // Safe cast: varint encoding of u64 is at most 10 bytes, which fits in usize on all platforms
    ::protobuf::rt::compute_raw_varint64_size(value) as usize
  }

  /// Encode a u64 as a varint into the buffer.
  /// Returns the number of bytes written, or None if the buffer is too small.
  #[must_use]
  pub fn encode(value: u64, buf: &mut [u8]) -> Option<usize> {
    let size = compute_size(value);
    if buf.len() < size {
      return None;
    }

    let mut stream = protobuf::CodedOutputStream::bytes(buf);
    stream.write_raw_varint64(value).ok()?;
    stream.flush().ok()?;
    Some(size)
  }

  /// Decode a varint from the buffer.
  /// Returns (value, `bytes_read`) or None if the buffer is incomplete/invalid.
  #[allow(clippy::cast_possible_truncation)]
  #[must_use]
  pub fn decode(buf: &[u8]) -> Option<(u64, usize)> {
    let mut stream = protobuf::CodedInputStream::from_bytes(buf);
    let value = stream.read_raw_varint64().ok()?;
    Some((value, stream.pos() as usize))
  }
}

// Encoded sizes, computable before any buffer is allocated.

#[must_use]
pub const fn bool_size() -> usize {
  1
}

#[must_use]
pub const fn float_size() -> usize {
  4
}

#[must_use]
pub const fn double_size() -> usize {
  8
}

#[must_use]
pub const fn fixed32_size() -> usize {
  4
}

#[must_use]
pub fn uint32_size(value: u32) -> usize {
  varint::compute_size(u64::from(value))
}

#[must_use]
pub fn uint64_size(value: u64) -> usize {
  varint::compute_size(value)
}

/// Negative values sign-extend to 64 bits, same as protobuf int32.
#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn int32_size(value: i32) -> usize {
  varint::compute_size(i64::from(value) as u64)
}

#[allow(clippy::cast_sign_loss)]
#[must_use]
pub fn int64_size(value: i64) -> usize {
  varint::compute_size(value as u64)
}

/// Size of `varint(len) || bytes`.
#[must_use]
pub fn data_size(len: usize) -> usize {
  varint::compute_size(len as u64) + len
}

//
// CodedOutput
//

/// Writes scalars into a fixed-size byte buffer. Callers size the buffer with the
/// `*_size` helpers; running out of space is a logic error surfaced as `Error::Decode`.
pub struct CodedOutput<'a> {
  buf: &'a mut [u8],
  pos: usize,
}

impl<'a> CodedOutput<'a> {
  pub fn new(buf: &'a mut [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.pos
  }

  pub fn write_raw_varint64(&mut self, value: u64) -> Result<()> {
    let written = varint::encode(value, &mut self.buf[self.pos ..])
      .ok_or_else(|| Error::Decode("output buffer too small for varint".to_string()))?;
    self.pos += written;
    Ok(())
  }

  pub fn write_raw_bytes(&mut self, data: &[u8]) -> Result<()> {
    let end = self.pos + data.len();
    let dst = self
      .buf
      .get_mut(self.pos .. end)
      .ok_or_else(|| Error::Decode("output buffer too small for raw bytes".to_string()))?;
    dst.copy_from_slice(data);
    self.pos = end;
    Ok(())
  }

  fn write_fixed(&mut self, data: &[u8]) -> Result<()> {
    self.write_raw_bytes(data)
  }

  pub fn write_bool(&mut self, value: bool) -> Result<()> {
    self.write_raw_varint64(u64::from(value))
  }

  pub fn write_uint32(&mut self, value: u32) -> Result<()> {
    self.write_raw_varint64(u64::from(value))
  }

  pub fn write_uint64(&mut self, value: u64) -> Result<()> {
    self.write_raw_varint64(value)
  }

  #[allow(clippy::cast_sign_loss)]
  pub fn write_int32(&mut self, value: i32) -> Result<()> {
    self.write_raw_varint64(i64::from(value) as u64)
  }

  #[allow(clippy::cast_sign_loss)]
  pub fn write_int64(&mut self, value: i64) -> Result<()> {
    self.write_raw_varint64(value as u64)
  }

  pub fn write_float(&mut self, value: f32) -> Result<()> {
    let mut tmp = [0_u8; 4];
    (&mut tmp[..]).put_f32_le(value);
    self.write_fixed(&tmp)
  }

  pub fn write_double(&mut self, value: f64) -> Result<()> {
    let mut tmp = [0_u8; 8];
    (&mut tmp[..]).put_f64_le(value);
    self.write_fixed(&tmp)
  }

  pub fn write_fixed32(&mut self, value: u32) -> Result<()> {
    let mut tmp = [0_u8; 4];
    (&mut tmp[..]).put_u32_le(value);
    self.write_fixed(&tmp)
  }

  /// Write `varint(len) || bytes`.
  pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
    self.write_raw_varint64(data.len() as u64)?;
    self.write_raw_bytes(data)
  }

  pub fn write_string(&mut self, value: &str) -> Result<()> {
    self.write_data(value.as_bytes())
  }
}

//
// CodedInput
//

/// Reads scalars from a byte slice. Any read past the end of the input yields
/// `Error::Decode`.
pub struct CodedInput<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> CodedInput<'a> {
  #[must_use]
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  #[must_use]
  pub fn position(&self) -> usize {
    self.pos
  }

  #[must_use]
  pub fn is_at_end(&self) -> bool {
    self.pos >= self.buf.len()
  }

  pub fn read_raw_varint64(&mut self) -> Result<u64> {
    let (value, read) = varint::decode(&self.buf[self.pos ..])
      .ok_or_else(|| Error::Decode("truncated or invalid varint".to_string()))?;
    self.pos += read;
    Ok(value)
  }

  fn read_raw_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
    let end = self
      .pos
      .checked_add(len)
      .ok_or_else(|| Error::Decode("length overflow".to_string()))?;
    let data = self
      .buf
      .get(self.pos .. end)
      .ok_or_else(|| Error::Decode(format!("read of {len} bytes past end of input")))?;
    self.pos = end;
    Ok(data)
  }

  pub fn read_bool(&mut self) -> Result<bool> {
    Ok(self.read_raw_varint64()? != 0)
  }

  #[allow(clippy::cast_possible_truncation)]
  pub fn read_uint32(&mut self) -> Result<u32> {
    Ok(self.read_raw_varint64()? as u32)
  }

  pub fn read_uint64(&mut self) -> Result<u64> {
    self.read_raw_varint64()
  }

  #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
  pub fn read_int32(&mut self) -> Result<i32> {
    Ok(self.read_raw_varint64()? as i32)
  }

  #[allow(clippy::cast_possible_wrap)]
  pub fn read_int64(&mut self) -> Result<i64> {
    Ok(self.read_raw_varint64()? as i64)
  }

  pub fn read_float(&mut self) -> Result<f32> {
    let mut data = self.read_raw_bytes(4)?;
    Ok(data.get_f32_le())
  }

  pub fn read_double(&mut self) -> Result<f64> {
    let mut data = self.read_raw_bytes(8)?;
    Ok(data.get_f64_le())
  }

  pub fn read_fixed32(&mut self) -> Result<u32> {
    let mut data = self.read_raw_bytes(4)?;
    Ok(data.get_u32_le())
  }

  /// Read `varint(len) || bytes`, returning the bytes.
  pub fn read_data(&mut self) -> Result<&'a [u8]> {
    let len = self.read_raw_varint64()?;
    let len = usize::try_from(len)
      .map_err(|_| Error::Decode(format!("length prefix {len} too large")))?;
    self.read_raw_bytes(len)
  }

  pub fn read_string(&mut self) -> Result<String> {
    let data = self.read_data()?;
    String::from_utf8(data.to_vec())
      .map_err(|e| Error::Decode(format!("invalid utf-8 in string value: {e}")))
  }
}

#[cfg(test)]
#[path = "./coded_test.rs"]
mod tests;
