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

//! Framing boundary of a single connection.
//!
//! One session corresponds to exactly one transport connection. Sends
//! serialize the frame and write every byte (short writes are looped);
//! concurrent senders are serialized by a fiber mutex, so frames appear on
//! the wire in call order. Receives are expected from a single fiber and
//! return `None` once the connection is closed or the peer violates the
//! protocol — pending callers then observe CLOSED.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use fiber::net::TcpStream;
use fiber::sync::Mutex;

use crate::protocol::{Frame, FrameHeader, HEADER_LEN};

/// Framed view over one TCP connection.
pub struct RpcSession {
    stream: TcpStream,
    send_lock: Mutex,
    connected: AtomicBool,
    peer: Option<SocketAddr>,
}

impl RpcSession {
    pub fn new(stream: TcpStream) -> RpcSession {
        let peer = stream.peer_addr().ok();
        RpcSession { stream, send_lock: Mutex::new(), connected: AtomicBool::new(true), peer }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> { self.peer }

    pub fn local_addr(&self) -> Option<SocketAddr> { self.stream.local_addr().ok() }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.stream.is_closed()
    }

    pub fn stream(&self) -> &TcpStream { &self.stream }

    /// Receives the next frame: header first, then exactly
    /// `content_length` payload bytes. Returns `None` on connection close,
    /// timeout or protocol violation; the session is unusable afterwards.
    pub fn recv(&self) -> Option<Frame> {
        let mut header = [0u8; HEADER_LEN];
        if !self.read_exact(&mut header) {
            self.mark_closed();
            return None;
        }
        let header = match FrameHeader::parse(&header) {
            Ok(header) => header,
            Err(err) => {
                log::warn!(
                    target: "fibernet::session",
                    "dropping session with {:?}: {err}", self.peer
                );
                self.mark_closed();
                return None;
            }
        };
        let mut payload = vec![0u8; header.content_length as usize];
        if !self.read_exact(&mut payload) {
            self.mark_closed();
            return None;
        }
        Some(Frame::new(header.message_type, payload, header.sequence_id))
    }

    /// Sends one frame, writing all bytes before releasing the send lock.
    pub fn send(&self, frame: &Frame) -> io::Result<usize> {
        let bytes = frame.serialize();
        let guard = self.send_lock.lock();
        let result = self.write_all(&bytes);
        drop(guard);
        if result.is_err() {
            self.mark_closed();
        }
        result.map(|_| bytes.len())
    }

    /// Closes the underlying stream; suspended reads and writes wake and
    /// observe the closure.
    pub fn close(&self) {
        self.mark_closed();
        self.stream.close();
    }

    fn mark_closed(&self) { self.connected.store(false, Ordering::Release); }

    fn read_exact(&self, buf: &mut [u8]) -> bool {
        let mut read = 0;
        while read < buf.len() {
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => return false,
                Ok(n) => read += n,
                Err(err) => {
                    log::trace!(
                        target: "fibernet::session",
                        "read from {:?} failed: {err}", self.peer
                    );
                    return false;
                }
            }
        }
        true
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < bytes.len() {
            let n = self.stream.write(&bytes[written..])?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            written += n;
        }
        Ok(())
    }
}
