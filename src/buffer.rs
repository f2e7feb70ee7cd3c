// Library for building coroutine-based RPC microservice architectures
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2024 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2024 Cyphernet Labs, IDCS, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segmented binary buffer with endian-aware typed codecs.
//!
//! A [`ByteArray`] is a chain of fixed-size chunks with three cursors —
//! `position` (next read/write), `size` (high-water mark) and `capacity` —
//! and a configurable integer byte order defaulting to big endian (network
//! order). Writes grow the capacity in whole-chunk increments and never move
//! existing bytes; reads fail once they would pass `size`.
//!
//! On top of the raw cursor the buffer offers the codecs the wire needs:
//! fixed-width integers with endian conversion, LEB128-style varints with
//! ZigZag for signed 32/64-bit values, IEEE floats re-interpreted to
//! same-width integers, and strings with 16/32/64-bit fixed or varint length
//! prefixes. Vectored read/write views expose the chunk chain for
//! scatter/gather I/O without copying.

use std::io::{IoSlice, IoSliceMut};

/// Default chunk size of a [`ByteArray`].
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Integer byte order of the typed codecs.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
#[display(lowercase)]
pub enum Endian {
    /// Network order; the default.
    #[default]
    Big,
    Little,
}

/// Errors of buffer reads and cursor moves.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum BufferError {
    /// read of {requested} bytes past the buffer size (only {available} available).
    Underflow {
        requested: usize,
        available: usize,
    },

    /// position {position} exceeds the buffer capacity {capacity}.
    PositionOverflow {
        position: usize,
        capacity: usize,
    },

    /// string data is not valid UTF-8.
    InvalidUtf8,
}

/// Segmented append-only binary buffer; see the module docs.
pub struct ByteArray {
    chunk_size: usize,
    position: usize,
    size: usize,
    capacity: usize,
    endian: Endian,
    chunks: Vec<Box<[u8]>>,
}

impl Default for ByteArray {
    fn default() -> Self { ByteArray::new() }
}

impl ByteArray {
    /// An empty buffer with the default chunk size and network byte order.
    pub fn new() -> ByteArray { ByteArray::with_chunk_size(DEFAULT_CHUNK_SIZE, Endian::Big) }

    /// An empty buffer over `chunk_size`-byte chunks.
    pub fn with_chunk_size(chunk_size: usize, endian: Endian) -> ByteArray {
        assert!(chunk_size > 0, "chunk size must be positive");
        ByteArray {
            chunk_size,
            position: 0,
            size: 0,
            capacity: chunk_size,
            endian,
            chunks: vec![vec![0u8; chunk_size].into_boxed_slice()],
        }
    }

    pub fn endian(&self) -> Endian { self.endian }

    pub fn set_endian(&mut self, endian: Endian) { self.endian = endian; }

    /// Next read/write offset.
    pub fn position(&self) -> usize { self.position }

    /// High-water mark of written data.
    pub fn size(&self) -> usize { self.size }

    pub fn capacity(&self) -> usize { self.capacity }

    /// Bytes readable from the current position.
    pub fn remaining(&self) -> usize { self.size - self.position }

    /// Moves the cursor; a position beyond `size` raises the high-water
    /// mark, one beyond `capacity` is rejected.
    pub fn set_position(&mut self, position: usize) -> Result<(), BufferError> {
        if position > self.capacity {
            return Err(BufferError::PositionOverflow { position, capacity: self.capacity });
        }
        self.position = position;
        if self.position > self.size {
            self.size = self.position;
        }
        Ok(())
    }

    /// Drops all content, shrinking back to a single chunk.
    pub fn clear(&mut self) {
        self.position = 0;
        self.size = 0;
        self.capacity = self.chunk_size;
        self.chunks.truncate(1);
    }

    fn grow_for(&mut self, additional: usize) {
        if additional == 0 {
            return;
        }
        let free = self.capacity - self.position;
        if free > additional {
            return;
        }
        let needed = additional - free;
        let count = needed.div_ceil(self.chunk_size);
        for _ in 0..count {
            self.chunks.push(vec![0u8; self.chunk_size].into_boxed_slice());
            self.capacity += self.chunk_size;
        }
    }

    /// Appends `data` at the cursor, growing the capacity as needed.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.grow_for(data.len());
        let mut written = 0;
        while written < data.len() {
            let chunk = self.position / self.chunk_size;
            let offset = self.position % self.chunk_size;
            let space = self.chunk_size - offset;
            let take = space.min(data.len() - written);
            self.chunks[chunk][offset..offset + take]
                .copy_from_slice(&data[written..written + take]);
            written += take;
            self.position += take;
        }
        if self.position > self.size {
            self.size = self.position;
        }
    }

    /// Fills `buf` from the cursor, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), BufferError> {
        if buf.len() > self.remaining() {
            return Err(BufferError::Underflow {
                requested: buf.len(),
                available: self.remaining(),
            });
        }
        self.copy_out(buf, self.position);
        self.position += buf.len();
        Ok(())
    }

    /// Fills `buf` from an explicit position without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], position: usize) -> Result<(), BufferError> {
        if position > self.size || buf.len() > self.size - position {
            return Err(BufferError::Underflow {
                requested: buf.len(),
                available: self.size.saturating_sub(position),
            });
        }
        self.copy_out(buf, position);
        Ok(())
    }

    fn copy_out(&self, buf: &mut [u8], mut position: usize) {
        let mut read = 0;
        while read < buf.len() {
            let chunk = position / self.chunk_size;
            let offset = position % self.chunk_size;
            let avail = self.chunk_size - offset;
            let take = avail.min(buf.len() - read);
            buf[read..read + take].copy_from_slice(&self.chunks[chunk][offset..offset + take]);
            read += take;
            position += take;
        }
    }

    /// Remaining readable bytes as an owned vector; the cursor stays put.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.remaining()];
        if !out.is_empty() {
            self.copy_out(&mut out, self.position);
        }
        out
    }

    /// Hex dump of the remaining readable bytes, 32 bytes per line.
    pub fn to_hex(&self) -> String {
        let bytes = self.to_bytes();
        let mut out = String::with_capacity(bytes.len() * 3);
        for (index, byte) in bytes.iter().enumerate() {
            if index > 0 && index % 32 == 0 {
                out.push('\n');
            } else if index > 0 {
                out.push(' ');
            }
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Read-side vectored view: spans covering up to `len` readable bytes
    /// from the cursor. The cursor does not advance — that is the caller's
    /// duty after the I/O call returns.
    pub fn read_buffers(&self, len: usize) -> Vec<IoSlice<'_>> {
        let len = len.min(self.remaining());
        let mut spans = Vec::new();
        let mut position = self.position;
        let mut left = len;
        while left > 0 {
            let chunk = position / self.chunk_size;
            let offset = position % self.chunk_size;
            let take = (self.chunk_size - offset).min(left);
            spans.push(IoSlice::new(&self.chunks[chunk][offset..offset + take]));
            position += take;
            left -= take;
        }
        spans
    }

    /// Write-side vectored view: spans covering `len` writable bytes from
    /// the cursor, growing the buffer as needed. The cursor does not
    /// advance — advance it with [`Self::set_position`] once the I/O call
    /// reports how much it transferred.
    pub fn write_buffers(&mut self, len: usize) -> Vec<IoSliceMut<'_>> {
        self.grow_for(len);
        let chunk_size = self.chunk_size;
        let first_chunk = self.position / chunk_size;
        let first_offset = self.position % chunk_size;
        let mut spans = Vec::new();
        let mut left = len;
        for (index, chunk) in self.chunks.iter_mut().enumerate().skip(first_chunk) {
            if left == 0 {
                break;
            }
            let offset = if index == first_chunk { first_offset } else { 0 };
            let take = (chunk_size - offset).min(left);
            spans.push(IoSliceMut::new(&mut chunk[offset..offset + take]));
            left -= take;
        }
        spans
    }

    fn write_int_bytes(&mut self, be: &[u8], le: &[u8]) {
        match self.endian {
            Endian::Big => self.write(be),
            Endian::Little => self.write(le),
        }
    }
}

macro_rules! fix_int_codec {
    ($write:ident, $read:ident, $ty:ty) => {
        impl ByteArray {
            /// Fixed-width write with endian conversion.
            pub fn $write(&mut self, value: $ty) {
                self.write_int_bytes(&value.to_be_bytes(), &value.to_le_bytes());
            }

            /// Fixed-width read with endian conversion.
            pub fn $read(&mut self) -> Result<$ty, BufferError> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read(&mut buf)?;
                Ok(match self.endian {
                    Endian::Big => <$ty>::from_be_bytes(buf),
                    Endian::Little => <$ty>::from_le_bytes(buf),
                })
            }
        }
    };
}

fix_int_codec!(write_fix_i8, read_fix_i8, i8);
fix_int_codec!(write_fix_u8, read_fix_u8, u8);
fix_int_codec!(write_fix_i16, read_fix_i16, i16);
fix_int_codec!(write_fix_u16, read_fix_u16, u16);
fix_int_codec!(write_fix_i32, read_fix_i32, i32);
fix_int_codec!(write_fix_u32, read_fix_u32, u32);
fix_int_codec!(write_fix_i64, read_fix_i64, i64);
fix_int_codec!(write_fix_u64, read_fix_u64, u64);

// ZigZag folds the sign bit into the lowest bit so small negative values
// stay short under varint encoding.
fn zigzag32(value: i32) -> u32 { ((value << 1) ^ (value >> 31)) as u32 }
fn zigzag64(value: i64) -> u64 { ((value << 1) ^ (value >> 63)) as u64 }
fn unzigzag32(value: u32) -> i32 { ((value >> 1) as i32) ^ -((value & 1) as i32) }
fn unzigzag64(value: u64) -> i64 { ((value >> 1) as i64) ^ -((value & 1) as i64) }

impl ByteArray {
    /// Varint write: 7 bits per byte, LSB group first, high bit marks
    /// continuation.
    pub fn write_var_u32(&mut self, mut value: u32) {
        let mut buf = [0u8; 5];
        let mut len = 0;
        while value >= 0x80 {
            buf[len] = (value as u8 & 0x7F) | 0x80;
            value >>= 7;
            len += 1;
        }
        buf[len] = value as u8;
        self.write(&buf[..=len]);
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        let mut buf = [0u8; 10];
        let mut len = 0;
        while value >= 0x80 {
            buf[len] = (value as u8 & 0x7F) | 0x80;
            value >>= 7;
            len += 1;
        }
        buf[len] = value as u8;
        self.write(&buf[..=len]);
    }

    pub fn write_var_i32(&mut self, value: i32) { self.write_var_u32(zigzag32(value)) }

    pub fn write_var_i64(&mut self, value: i64) { self.write_var_u64(zigzag64(value)) }

    pub fn read_var_u32(&mut self) -> Result<u32, BufferError> {
        let mut result = 0u32;
        for shift in (0..32).step_by(7) {
            let byte = self.read_fix_u8()?;
            if byte < 0x80 {
                result |= (byte as u32) << shift;
                break;
            }
            result |= ((byte & 0x7F) as u32) << shift;
        }
        Ok(result)
    }

    pub fn read_var_u64(&mut self) -> Result<u64, BufferError> {
        let mut result = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.read_fix_u8()?;
            if byte < 0x80 {
                result |= (byte as u64) << shift;
                break;
            }
            result |= ((byte & 0x7F) as u64) << shift;
        }
        Ok(result)
    }

    pub fn read_var_i32(&mut self) -> Result<i32, BufferError> {
        Ok(unzigzag32(self.read_var_u32()?))
    }

    pub fn read_var_i64(&mut self) -> Result<i64, BufferError> {
        Ok(unzigzag64(self.read_var_u64()?))
    }

    /// Floats travel as same-width integers, bit pattern preserved.
    pub fn write_f32(&mut self, value: f32) { self.write_fix_u32(value.to_bits()) }

    pub fn write_f64(&mut self, value: f64) { self.write_fix_u64(value.to_bits()) }

    pub fn read_f32(&mut self) -> Result<f32, BufferError> {
        Ok(f32::from_bits(self.read_fix_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, BufferError> {
        Ok(f64::from_bits(self.read_fix_u64()?))
    }

    pub fn write_string_f16(&mut self, value: &str) {
        self.write_fix_u16(value.len() as u16);
        self.write(value.as_bytes());
    }

    pub fn write_string_f32(&mut self, value: &str) {
        self.write_fix_u32(value.len() as u32);
        self.write(value.as_bytes());
    }

    pub fn write_string_f64(&mut self, value: &str) {
        self.write_fix_u64(value.len() as u64);
        self.write(value.as_bytes());
    }

    /// Varint-length-prefixed string; the wire default.
    pub fn write_string_vint(&mut self, value: &str) {
        self.write_var_u64(value.len() as u64);
        self.write(value.as_bytes());
    }

    /// Raw string bytes with no length information.
    pub fn write_string_raw(&mut self, value: &str) { self.write(value.as_bytes()) }

    fn read_string_len(&mut self, len: usize) -> Result<String, BufferError> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        String::from_utf8(buf).map_err(|_| BufferError::InvalidUtf8)
    }

    pub fn read_string_f16(&mut self) -> Result<String, BufferError> {
        let len = self.read_fix_u16()? as usize;
        self.read_string_len(len)
    }

    pub fn read_string_f32(&mut self) -> Result<String, BufferError> {
        let len = self.read_fix_u32()? as usize;
        self.read_string_len(len)
    }

    pub fn read_string_f64(&mut self) -> Result<String, BufferError> {
        let len = self.read_fix_u64()? as usize;
        self.read_string_len(len)
    }

    pub fn read_string_vint(&mut self) -> Result<String, BufferError> {
        let len = self.read_var_u64()? as usize;
        self.read_string_len(len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cursor_invariants() {
        let mut buf = ByteArray::new();
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.size(), 0);
        buf.write(b"abcdef");
        assert_eq!(buf.position(), 6);
        assert_eq!(buf.size(), 6);

        buf.set_position(0).unwrap();
        let mut out = [0u8; 6];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"abcdef");
        assert_eq!(buf.position(), buf.size());

        assert!(matches!(buf.read(&mut out), Err(BufferError::Underflow { .. })));
        assert!(matches!(
            buf.set_position(buf.capacity() + 1),
            Err(BufferError::PositionOverflow { .. })
        ));
    }

    #[test]
    fn writes_cross_chunk_boundaries() {
        let mut buf = ByteArray::with_chunk_size(4, Endian::Big);
        let data: Vec<u8> = (0..=40).collect();
        buf.write(&data);
        assert!(buf.capacity() >= data.len());

        buf.set_position(0).unwrap();
        let mut out = vec![0u8; data.len()];
        buf.read(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn fixed_width_endian_round_trip() {
        for endian in [Endian::Big, Endian::Little] {
            let mut buf = ByteArray::with_chunk_size(3, endian);
            buf.write_fix_u16(0xBEEF);
            buf.write_fix_i32(-123456);
            buf.write_fix_u64(0xDEAD_BEEF_CAFE_BABE);
            buf.write_f64(std::f64::consts::PI);
            buf.set_position(0).unwrap();
            assert_eq!(buf.read_fix_u16().unwrap(), 0xBEEF);
            assert_eq!(buf.read_fix_i32().unwrap(), -123456);
            assert_eq!(buf.read_fix_u64().unwrap(), 0xDEAD_BEEF_CAFE_BABE);
            assert_eq!(buf.read_f64().unwrap(), std::f64::consts::PI);
        }
    }

    #[test]
    fn big_endian_layout_on_the_wire() {
        let mut buf = ByteArray::new();
        buf.write_fix_u32(0x01020304);
        buf.set_position(0).unwrap();
        assert_eq!(buf.to_bytes(), vec![0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn varint_known_vectors() {
        let mut buf = ByteArray::new();
        buf.write_var_i32(-1);
        buf.write_var_i32(0);
        buf.write_var_i32(1);
        buf.write_var_i32(i32::MAX);
        buf.set_position(0).unwrap();
        assert_eq!(buf.to_bytes(), vec![0x01, 0x00, 0x02, 0xFE, 0xFF, 0xFF, 0xFF, 0x0F]);

        assert_eq!(buf.read_var_i32().unwrap(), -1);
        assert_eq!(buf.read_var_i32().unwrap(), 0);
        assert_eq!(buf.read_var_i32().unwrap(), 1);
        assert_eq!(buf.read_var_i32().unwrap(), i32::MAX);
    }

    #[test]
    fn varint_extremes_round_trip() {
        let mut buf = ByteArray::new();
        for value in [i32::MIN, i32::MAX, -1, 0, 1, 300, -300] {
            buf.write_var_i32(value);
        }
        for value in [i64::MIN, i64::MAX, -1, 0, 1, 1 << 40, -(1 << 40)] {
            buf.write_var_i64(value);
        }
        for value in [u64::MAX, 0, 127, 128, 1 << 56] {
            buf.write_var_u64(value);
        }
        buf.set_position(0).unwrap();
        for value in [i32::MIN, i32::MAX, -1, 0, 1, 300, -300] {
            assert_eq!(buf.read_var_i32().unwrap(), value);
        }
        for value in [i64::MIN, i64::MAX, -1, 0, 1, 1 << 40, -(1 << 40)] {
            assert_eq!(buf.read_var_i64().unwrap(), value);
        }
        for value in [u64::MAX, 0, 127, 128, 1 << 56] {
            assert_eq!(buf.read_var_u64().unwrap(), value);
        }
    }

    #[test]
    fn string_prefix_widths() {
        let mut buf = ByteArray::with_chunk_size(8, Endian::Big);
        buf.write_string_f16("fix16");
        buf.write_string_f32("fix32");
        buf.write_string_f64("fix64");
        buf.write_string_vint("varint-prefixed string crossing chunks");
        buf.set_position(0).unwrap();
        assert_eq!(buf.read_string_f16().unwrap(), "fix16");
        assert_eq!(buf.read_string_f32().unwrap(), "fix32");
        assert_eq!(buf.read_string_f64().unwrap(), "fix64");
        assert_eq!(
            buf.read_string_vint().unwrap(),
            "varint-prefixed string crossing chunks"
        );
    }

    #[test]
    fn vectored_views_cover_the_data() {
        let mut buf = ByteArray::with_chunk_size(4, Endian::Big);
        buf.write(b"0123456789");
        buf.set_position(0).unwrap();

        let spans = buf.read_buffers(10);
        let gathered: Vec<u8> =
            spans.iter().flat_map(|span| span.iter().copied()).collect();
        assert_eq!(gathered, b"0123456789");

        let mut buf = ByteArray::with_chunk_size(4, Endian::Big);
        let total: usize = buf.write_buffers(10).iter().map(|span| span.len()).sum();
        assert_eq!(total, 10);
        // The view does not advance the cursor.
        assert_eq!(buf.position(), 0);
    }
}
