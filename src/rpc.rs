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

//! Shared RPC vocabulary: call status codes and the serializable result
//! wrapper every call produces exactly once.

use crate::buffer::ByteArray;
use crate::serialize::{Decode, DecodeError, Encode};

/// Key prefix under which the registry publishes service up/down deltas to
/// subscribed connection pools.
pub const SERVICE_SUBSCRIBE: &str = "[[rpc service subscribe]]";

/// Status of an RPC call.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
#[display(lowercase)]
#[repr(u16)]
pub enum RpcCode {
    /// The call completed and the value is valid.
    #[default]
    Success = 0,
    /// Generic failure: no reachable provider, dial failure.
    Fail = 1,
    /// Arguments or return value did not deserialize into the expected
    /// types.
    NoMatch = 2,
    /// No such handler on the server, or no providers at the registry.
    NoMethod = 3,
    /// The transport died before or during the call.
    Closed = 4,
    /// The call did not complete before the caller's deadline.
    Timeout = 5,
}

impl RpcCode {
    fn from_u16(raw: u16) -> Option<RpcCode> {
        Some(match raw {
            0 => RpcCode::Success,
            1 => RpcCode::Fail,
            2 => RpcCode::NoMatch,
            3 => RpcCode::NoMethod,
            4 => RpcCode::Closed,
            5 => RpcCode::Timeout,
            _ => return None,
        })
    }
}

/// Outcome of an RPC call: a status code, a human message and — when the
/// code is [`RpcCode::Success`] — a value.
///
/// On the wire the code travels as a fixed u16, the message as a
/// varint-prefixed string; the value is always written but only read back
/// for successful results. Void values occupy the unit placeholder byte.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct RpcResult<T = ()> {
    code: RpcCode,
    message: String,
    value: T,
}

impl<T: Default> RpcResult<T> {
    /// A failed outcome carrying a default-constructed value.
    pub fn error(code: RpcCode, message: impl Into<String>) -> RpcResult<T> {
        RpcResult { code, message: message.into(), value: T::default() }
    }

    pub fn fail() -> RpcResult<T> { RpcResult::error(RpcCode::Fail, "fail") }
}

impl<T> RpcResult<T> {
    pub fn success(value: T) -> RpcResult<T> {
        RpcResult { code: RpcCode::Success, message: s!("success"), value }
    }

    pub fn is_ok(&self) -> bool { self.code == RpcCode::Success }

    pub fn code(&self) -> RpcCode { self.code }

    pub fn message(&self) -> &str { &self.message }

    pub fn value(&self) -> &T { &self.value }

    pub fn into_value(self) -> T { self.value }

    /// Splits the wrapper into its parts.
    pub fn into_parts(self) -> (RpcCode, String, T) { (self.code, self.message, self.value) }
}

impl<T: Encode> Encode for RpcResult<T> {
    fn encode(&self, buf: &mut ByteArray) {
        buf.write_fix_u16(self.code as u16);
        buf.write_string_vint(&self.message);
        self.value.encode(buf);
    }
}

impl<T: Decode + Default> Decode for RpcResult<T> {
    fn decode(buf: &mut ByteArray) -> Result<Self, DecodeError> {
        let raw = buf.read_fix_u16()?;
        let code =
            RpcCode::from_u16(raw).ok_or(DecodeError::InvalidDiscriminant(raw as u64))?;
        let message = buf.read_string_vint()?;
        let value = if code == RpcCode::Success { T::decode(buf)? } else { T::default() };
        Ok(RpcResult { code, message, value })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::serialize::Serializer;

    #[test]
    fn success_round_trip() {
        let mut s = Serializer::new();
        s.write(&RpcResult::success(7i32));
        s.reset();
        let result: RpcResult<i32> = s.read().unwrap();
        assert!(result.is_ok());
        assert_eq!(result.message(), "success");
        assert_eq!(*result.value(), 7);
    }

    #[test]
    fn error_skips_the_value_on_decode() {
        let mut s = Serializer::new();
        s.write(&RpcResult::<String>::error(RpcCode::NoMethod, "discover service: Add"));
        s.reset();
        let result: RpcResult<String> = s.read().unwrap();
        assert_eq!(result.code(), RpcCode::NoMethod);
        assert_eq!(result.message(), "discover service: Add");
        assert_eq!(result.value(), "");
    }

    #[test]
    fn void_result_wire_shape() {
        let mut s = Serializer::new();
        s.write(&RpcResult::success(()));
        s.reset();
        // u16 code + 1-byte message length + 7 message bytes + placeholder.
        assert_eq!(s.len(), 2 + 1 + 7 + 1);
        assert!(s.read::<RpcResult<()>>().unwrap().is_ok());
    }
}
