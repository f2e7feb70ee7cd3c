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

//! Typed serialization over [`ByteArray`].
//!
//! Encoding rules: 8/16-bit integers, booleans and floats are fixed-width;
//! 32/64-bit signed integers travel ZigZag+varint and unsigned ones plain
//! varint; strings carry a varint length prefix; containers and maps carry
//! a varint element count and recurse; tuples encode their fields in
//! declaration order with no prefix. The unit type encodes as a single
//! placeholder byte so that void values still occupy a wire position.
//!
//! Decoding is strict: truncation or malformed data surfaces as a
//! [`DecodeError`] which the RPC layer translates into a NO_MATCH result —
//! it never reaches application code as a panic.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use crate::buffer::{BufferError, ByteArray};

/// Errors of typed decoding.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum DecodeError {
    /// malformed buffer content: {0}
    #[from]
    Buffer(BufferError),

    /// boolean byte holds {0} instead of 0 or 1.
    InvalidBool(u8),

    /// unknown enumeration discriminant {0}.
    InvalidDiscriminant(u64),
}

/// Value which can be written into a [`Serializer`].
pub trait Encode {
    fn encode(&self, buf: &mut ByteArray);
}

/// Value which can be read back from a [`Serializer`].
pub trait Decode: Sized {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// A thin typed view over a [`ByteArray`].
#[derive(Default)]
pub struct Serializer {
    buf: ByteArray,
}

impl Serializer {
    pub fn new() -> Serializer { Serializer { buf: ByteArray::new() } }

    /// Wraps raw bytes for decoding; the cursor starts at the front.
    pub fn from_bytes(data: &[u8]) -> Serializer {
        let mut buf = ByteArray::new();
        buf.write(data);
        buf.set_position(0).expect("fresh buffer accepts position 0");
        Serializer { buf }
    }

    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) { value.encode(&mut self.buf) }

    pub fn read<T: Decode>(&mut self) -> Result<T, DecodeError> { T::decode(&mut self.buf) }

    /// Rewinds the cursor so written data can be read back.
    pub fn reset(&mut self) {
        self.buf.set_position(0).expect("position 0 is always within capacity");
    }

    pub fn clear(&mut self) { self.buf.clear() }

    pub fn len(&self) -> usize { self.buf.size() }

    pub fn is_empty(&self) -> bool { self.buf.size() == 0 }

    /// Remaining (unread) bytes as an owned vector.
    pub fn to_bytes(&self) -> Vec<u8> { self.buf.to_bytes() }

    pub fn byte_array(&mut self) -> &mut ByteArray { &mut self.buf }
}

macro_rules! scalar_codec {
    ($ty:ty, $write:ident, $read:ident) => {
        impl Encode for $ty {
            fn encode(&self, buf: &mut ByteArray) { buf.$write(*self) }
        }
        impl Decode for $ty {
            fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> { Ok(buf.$read()?) }
        }
    };
}

scalar_codec!(i8, write_fix_i8, read_fix_i8);
scalar_codec!(u8, write_fix_u8, read_fix_u8);
scalar_codec!(i16, write_fix_i16, read_fix_i16);
scalar_codec!(u16, write_fix_u16, read_fix_u16);
scalar_codec!(i32, write_var_i32, read_var_i32);
scalar_codec!(u32, write_var_u32, read_var_u32);
scalar_codec!(i64, write_var_i64, read_var_i64);
scalar_codec!(u64, write_var_u64, read_var_u64);
scalar_codec!(f32, write_f32, read_f32);
scalar_codec!(f64, write_f64, read_f64);

impl Encode for bool {
    fn encode(&self, buf: &mut ByteArray) { buf.write_fix_u8(*self as u8) }
}

impl Decode for bool {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        match buf.read_fix_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
}

// Container lengths travel as varint u64 regardless of the platform width.
impl Encode for usize {
    fn encode(&self, buf: &mut ByteArray) { buf.write_var_u64(*self as u64) }
}

impl Decode for usize {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(buf.read_var_u64()? as usize)
    }
}

impl Encode for str {
    fn encode(&self, buf: &mut ByteArray) { buf.write_string_vint(self) }
}

impl Encode for String {
    fn encode(&self, buf: &mut ByteArray) { buf.write_string_vint(self) }
}

impl Decode for String {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        Ok(buf.read_string_vint()?)
    }
}

// Void occupies one placeholder byte for wire uniformity.
impl Encode for () {
    fn encode(&self, buf: &mut ByteArray) { buf.write_fix_u8(0) }
}

impl Decode for () {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        buf.read_fix_u8()?;
        Ok(())
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, buf: &mut ByteArray) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = usize::decode(buf)?;
        let mut out = Vec::new();
        for _ in 0..len {
            out.push(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for BTreeSet<T> {
    fn encode(&self, buf: &mut ByteArray) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode + Ord> Decode for BTreeSet<T> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = usize::decode(buf)?;
        let mut out = BTreeSet::new();
        for _ in 0..len {
            out.insert(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<T: Encode> Encode for HashSet<T> {
    fn encode(&self, buf: &mut ByteArray) {
        self.len().encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decode + Eq + Hash> Decode for HashSet<T> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = usize::decode(buf)?;
        let mut out = HashSet::new();
        for _ in 0..len {
            out.insert(T::decode(buf)?);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, buf: &mut ByteArray) {
        self.len().encode(buf);
        for (key, value) in self {
            key.encode(buf);
            value.encode(buf);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = usize::decode(buf)?;
        let mut out = BTreeMap::new();
        for _ in 0..len {
            let key = K::decode(buf)?;
            let value = V::decode(buf)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

impl<K: Encode, V: Encode> Encode for HashMap<K, V> {
    fn encode(&self, buf: &mut ByteArray) {
        self.len().encode(buf);
        for (key, value) in self {
            key.encode(buf);
            value.encode(buf);
        }
    }
}

impl<K: Decode + Eq + Hash, V: Decode> Decode for HashMap<K, V> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = usize::decode(buf)?;
        let mut out = HashMap::new();
        for _ in 0..len {
            let key = K::decode(buf)?;
            let value = V::decode(buf)?;
            out.insert(key, value);
        }
        Ok(out)
    }
}

macro_rules! tuple_codec {
    ($($name:ident),+) => {
        impl<$($name: Encode),+> Encode for ($($name,)+) {
            fn encode(&self, buf: &mut ByteArray) {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                $($name.encode(buf);)+
            }
        }
        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
                Ok(($($name::decode(buf)?,)+))
            }
        }
    };
}

tuple_codec!(A);
tuple_codec!(A, B);
tuple_codec!(A, B, C);
tuple_codec!(A, B, C, D);
tuple_codec!(A, B, C, D, E);
tuple_codec!(A, B, C, D, E, F);
tuple_codec!(A, B, C, D, E, F, G);
tuple_codec!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let mut s = Serializer::new();
        s.write(&value);
        s.reset();
        assert_eq!(s.read::<T>().unwrap(), value);
    }

    #[test]
    fn primitives_round_trip() {
        round_trip(0xABu8);
        round_trip(-5i8);
        round_trip(0xBEEFu16);
        round_trip(-30000i16);
        round_trip(i32::MIN);
        round_trip(u32::MAX);
        round_trip(i64::MIN);
        round_trip(u64::MAX);
        round_trip(true);
        round_trip(core::f32::consts::E);
        round_trip(core::f64::consts::PI);
        round_trip(String::from("здравствуйте"));
        round_trip(());
    }

    #[test]
    fn containers_round_trip() {
        round_trip(vec![1i32, -2, 3]);
        round_trip(BTreeSet::from(["a".to_owned(), "b".to_owned()]));
        round_trip(HashSet::from([1u64, 2, 3]));
        round_trip(BTreeMap::from([("k".to_owned(), 1i32), ("l".to_owned(), -1)]));
        round_trip(HashMap::from([(1u32, "one".to_owned()), (2, "two".to_owned())]));
        round_trip(vec![vec![1u16], vec![], vec![2, 3]]);
    }

    #[test]
    fn tuples_encode_in_declaration_order() {
        let mut s = Serializer::new();
        s.write(&(3i32, 4i32));
        s.reset();
        // ZigZag: 3 -> 6, 4 -> 8; no length prefix.
        assert_eq!(s.to_bytes(), vec![0x06, 0x08]);
        assert_eq!(s.read::<(i32, i32)>().unwrap(), (3, 4));

        round_trip((1u8, -2i64, "three".to_owned(), vec![4.0f64]));
    }

    #[test]
    fn unit_occupies_one_byte() {
        let mut s = Serializer::new();
        s.write(&());
        assert_eq!(s.len(), 1);
        s.reset();
        assert_eq!(s.to_bytes(), vec![0x00]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let mut s = Serializer::from_bytes(&[0x96, 0x01]);
        assert_eq!(s.read::<i32>().unwrap(), 75);
        assert!(matches!(
            Serializer::from_bytes(&[0x05, b'a', b'b']).read::<String>(),
            Err(DecodeError::Buffer(BufferError::Underflow { .. }))
        ));
        assert!(Serializer::from_bytes(&[]).read::<u32>().is_err());
    }

    #[test]
    fn strict_bool_decoding() {
        assert!(matches!(
            Serializer::from_bytes(&[0x02]).read::<bool>(),
            Err(DecodeError::InvalidBool(2))
        ));
    }
}
