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

//! Length-delimited wire protocol.
//!
//! ```text
//! +--------+---------+--------+---------------+----------------+---------...
//! | magic  | version |  type  |  sequence id  | content length | content
//! | 0xCC   | 0x01    | 1 byte | u32 big end.  | u32 big endian | bytes
//! +--------+---------+--------+---------------+----------------+---------...
//! ```
//!
//! The header is exactly [`HEADER_LEN`] bytes; a zero content length is a
//! valid frame (heartbeats are such frames). Sequence id zero marks
//! fire-and-forget frames; method requests use ids starting at one and the
//! responder echoes the request id.

use crate::buffer::{BufferError, ByteArray};

/// First byte of every frame.
pub const MAGIC: u8 = 0xCC;
/// Protocol revision carried in the second byte.
pub const VERSION: u8 = 0x01;
/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 11;

/// Message discriminator carried in the third header byte.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(Debug)]
#[repr(u8)]
pub enum MessageType {
    /// Keep-alive; empty payload.
    HeartbeatPacket = 0,
    /// Session announces itself as a service provider; payload is the
    /// listening port.
    RpcProvider = 1,
    /// Session announces itself as a consumer (reserved).
    RpcConsumer = 2,
    /// Reserved generic request.
    RpcRequest = 3,
    /// Reserved generic response.
    RpcResponse = 4,
    /// Method call: serialized (name, argument tuple).
    RpcMethodRequest = 5,
    /// Method reply: serialized result.
    RpcMethodResponse = 6,
    /// Provider registers a service with the registry.
    RpcServiceRegister = 7,
    RpcServiceRegisterResponse = 8,
    /// Consumer looks a service up by name.
    RpcServiceDiscover = 9,
    RpcServiceDiscoverResponse = 10,
    /// Subscription to a key.
    RpcSubscribeRequest = 11,
    RpcSubscribeResponse = 12,
    /// Publication to every subscriber of a key.
    RpcPublishRequest = 13,
    RpcPublishResponse = 14,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<MessageType> {
        use MessageType::*;
        Some(match raw {
            0 => HeartbeatPacket,
            1 => RpcProvider,
            2 => RpcConsumer,
            3 => RpcRequest,
            4 => RpcResponse,
            5 => RpcMethodRequest,
            6 => RpcMethodResponse,
            7 => RpcServiceRegister,
            8 => RpcServiceRegisterResponse,
            9 => RpcServiceDiscover,
            10 => RpcServiceDiscoverResponse,
            11 => RpcSubscribeRequest,
            12 => RpcSubscribeResponse,
            13 => RpcPublishRequest,
            14 => RpcPublishResponse,
            _ => return None,
        })
    }
}

/// Errors of frame header parsing.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum FrameError {
    /// invalid magic byte {0:#04x}.
    BadMagic(u8),

    /// unsupported protocol version {0:#04x}.
    BadVersion(u8),

    /// unknown message type {0:#04x}.
    UnknownType(u8),

    /// frame header truncated: {0}
    #[from]
    Truncated(BufferError),
}

/// Parsed fixed header of a frame.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub sequence_id: u32,
    pub content_length: u32,
}

impl FrameHeader {
    /// Parses exactly [`HEADER_LEN`] bytes. A magic mismatch is fatal to
    /// the session.
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<FrameHeader, FrameError> {
        let mut buf = ByteArray::new();
        buf.write(bytes);
        buf.set_position(0).expect("fresh buffer accepts position 0");
        let magic = buf.read_fix_u8()?;
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf.read_fix_u8()?;
        if version != VERSION {
            return Err(FrameError::BadVersion(version));
        }
        let raw_type = buf.read_fix_u8()?;
        let message_type = MessageType::from_u8(raw_type).ok_or(FrameError::UnknownType(raw_type))?;
        let sequence_id = buf.read_fix_u32()?;
        let content_length = buf.read_fix_u32()?;
        Ok(FrameHeader { message_type, sequence_id, content_length })
    }
}

/// One protocol frame: header plus opaque payload.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Frame {
    pub message_type: MessageType,
    pub sequence_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Vec<u8>, sequence_id: u32) -> Frame {
        Frame { message_type, sequence_id, payload }
    }

    /// The canonical keep-alive frame.
    pub fn heartbeat() -> Frame { Frame::new(MessageType::HeartbeatPacket, Vec::new(), 0) }

    /// Serializes header and payload into wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = ByteArray::new();
        buf.write_fix_u8(MAGIC);
        buf.write_fix_u8(VERSION);
        buf.write_fix_u8(self.message_type as u8);
        buf.write_fix_u32(self.sequence_id);
        buf.write_fix_u32(self.payload.len() as u32);
        buf.write(&self.payload);
        buf.set_position(0).expect("fresh buffer accepts position 0");
        buf.to_bytes()
    }

    /// Parses a complete frame; the inverse of [`Self::serialize`].
    pub fn parse(bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated(BufferError::Underflow {
                requested: HEADER_LEN,
                available: bytes.len(),
            }));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = FrameHeader::parse(&header)?;
        let body = &bytes[HEADER_LEN..];
        if body.len() < header.content_length as usize {
            return Err(FrameError::Truncated(BufferError::Underflow {
                requested: header.content_length as usize,
                available: body.len(),
            }));
        }
        Ok(Frame {
            message_type: header.message_type,
            sequence_id: header.sequence_id,
            payload: body[..header.content_length as usize].to_vec(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn heartbeat_bytes() {
        let frame = Frame::heartbeat();
        assert_eq!(frame.serialize(), vec![
            0xCC, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00
        ]);
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::new(MessageType::RpcMethodRequest, b"payload".to_vec(), 42);
        let bytes = frame.serialize();
        assert_eq!(bytes.len(), HEADER_LEN + 7);
        // Sequence id and length are big-endian on the wire.
        assert_eq!(&bytes[3..7], &[0x00, 0x00, 0x00, 0x2A]);
        assert_eq!(&bytes[7..11], &[0x00, 0x00, 0x00, 0x07]);
        assert_eq!(Frame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = Frame::heartbeat().serialize();
        bytes[0] = 0xCD;
        assert!(matches!(Frame::parse(&bytes), Err(FrameError::BadMagic(0xCD))));
    }

    #[test]
    fn message_types_are_stable() {
        assert_eq!(MessageType::HeartbeatPacket as u8, 0);
        assert_eq!(MessageType::RpcProvider as u8, 1);
        assert_eq!(MessageType::RpcMethodRequest as u8, 5);
        assert_eq!(MessageType::RpcServiceRegister as u8, 7);
        assert_eq!(MessageType::RpcServiceDiscover as u8, 9);
        assert_eq!(MessageType::RpcPublishRequest as u8, 13);
        for raw in 0..=14u8 {
            assert_eq!(MessageType::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(MessageType::from_u8(15).is_none());
    }
}
