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

//! RPC client: one connection to one server.
//!
//! Outgoing frames funnel through a bounded channel drained by a dedicated
//! send fiber; a receive fiber reads frames and routes method responses to
//! pending calls by sequence id and publishes to subscription callbacks.
//! Every call produces exactly one [`RpcResult`]. An optional auto
//! heartbeat declares the server dead after a silent period, closing the
//! client — which wakes every pending call with CLOSED.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, RwLock};

use fiber::config::{self, ConfigVar};
use fiber::net::{self, TcpStream};
use fiber::sync::Channel;
use fiber::{Reactor, Timer};

use crate::guarded::Guarded;
use crate::protocol::{Frame, MessageType};
use crate::rpc::{RpcCode, RpcResult};
use crate::serialize::{Decode, Encode, Serializer};
use crate::session::RpcSession;

/// Interval of the client auto heartbeat.
const HEARTBEAT_MS: u64 = 30_000;

static CHANNEL_CAPACITY: LazyLock<Arc<ConfigVar<u64>>> = LazyLock::new(|| {
    config::lookup("rpc.client.channel_capacity", 1024, "rpc client outbound channel capacity")
});

/// Callback invoked for publish frames matching a subscribed key; receives
/// the payload positioned after the key.
pub type SubscribeCallback = Box<dyn Fn(&mut Serializer) + Send + Sync>;

/// Client side of one RPC connection.
pub struct RpcClient {
    auto_heartbeat: bool,
    closed: AtomicBool,
    heart_overdue: AtomicBool,
    timeout_ms: AtomicU64,
    sequence_id: AtomicU32,
    session: RwLock<Option<Arc<RpcSession>>>,
    outbound: RwLock<Option<Channel<Frame>>>,
    pending: Guarded<HashMap<u32, Channel<Frame>>>,
    subscriptions: Guarded<HashMap<String, SubscribeCallback>>,
    heart_timer: StdMutex<Option<Timer>>,
}

struct CallCancelled {
    timed_out: AtomicBool,
}

impl RpcClient {
    /// A disconnected client; `auto_heartbeat` arms the 30-second liveness
    /// probe on connect.
    pub fn new(auto_heartbeat: bool) -> Arc<RpcClient> {
        Arc::new(RpcClient {
            auto_heartbeat,
            closed: AtomicBool::new(true),
            heart_overdue: AtomicBool::new(false),
            timeout_ms: AtomicU64::new(net::NO_TIMEOUT),
            sequence_id: AtomicU32::new(1),
            session: RwLock::new(None),
            outbound: RwLock::new(None),
            pending: Guarded::new(empty!()),
            subscriptions: Guarded::new(empty!()),
            heart_timer: StdMutex::new(None),
        })
    }

    /// Per-call timeout; the default waits forever.
    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        match &*self.session.read().expect("client session lock") {
            Some(session) => !session.is_connected(),
            None => true,
        }
    }

    /// Remote address of the connected server.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.read().expect("client session lock").as_ref().and_then(|s| s.peer_addr())
    }

    /// Dials the server and starts the send/receive fibers. Must run on a
    /// reactor fiber.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let reactor = Reactor::current();
        let stream = TcpStream::connect_timeout(addr, self.timeout_ms.load(Ordering::Acquire))?;
        let session = Arc::new(RpcSession::new(stream));
        *self.session.write().expect("client session lock") = Some(session);
        let outbound = Channel::new(CHANNEL_CAPACITY.get() as usize);
        *self.outbound.write().expect("client outbound lock") = Some(outbound);
        self.closed.store(false, Ordering::Release);
        self.heart_overdue.store(false, Ordering::Release);

        let recv = self.clone();
        reactor.schedule(move || recv.handle_recv());
        let send = self.clone();
        reactor.schedule(move || send.handle_send());

        if self.auto_heartbeat {
            let weak = Arc::downgrade(self);
            let timer = reactor.add_timer(
                HEARTBEAT_MS,
                move || {
                    let Some(client) = weak.upgrade() else { return };
                    client.heartbeat_tick();
                },
                true,
            );
            *self.heart_timer.lock().expect("client heart lock") = Some(timer);
        }
        Ok(())
    }

    /// Closes the connection. Every pending call wakes with CLOSED; the
    /// send and receive fibers finish.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "fibernet::client", "closing client to {:?}", self.peer_addr());
        let outbound = self.outbound.read().expect("client outbound lock").clone();
        if let Some(outbound) = outbound {
            outbound.close();
        }
        let pending = self.pending.with(std::mem::take);
        for (_, channel) in pending {
            channel.close();
        }
        if let Some(timer) = self.heart_timer.lock().expect("client heart lock").take() {
            timer.cancel();
        }
        if let Some(session) = self.session.read().expect("client session lock").as_ref() {
            session.close();
        }
    }

    /// Calls `name` with `args`, blocking the calling fiber until a reply,
    /// a timeout or connection loss.
    pub fn call<R, A>(&self, name: &str, args: A) -> RpcResult<R>
    where
        R: Decode + Default,
        A: Encode,
    {
        let mut s = Serializer::new();
        s.write(name);
        s.write(&args);
        s.reset();
        self.call_payload(s.to_bytes())
    }

    /// Asynchronous call: the result arrives on the returned one-slot
    /// channel.
    pub fn async_call<R, A>(self: &Arc<Self>, name: &str, args: A) -> Channel<RpcResult<R>>
    where
        R: Decode + Default + Send + 'static,
        A: Encode + Send + 'static,
    {
        let channel = Channel::new(1);
        let result = channel.clone();
        let client = self.clone();
        let name = name.to_owned();
        Reactor::current().schedule(move || {
            result.send(client.call(&name, args));
        });
        channel
    }

    /// Callback call: `callback` is invoked with the outcome from a
    /// scheduled fiber.
    pub fn call_with<R, A>(
        self: &Arc<Self>,
        name: &str,
        args: A,
        callback: impl FnOnce(RpcResult<R>) + Send + 'static,
    ) where
        R: Decode + Default + Send + 'static,
        A: Encode + Send + 'static,
    {
        let client = self.clone();
        let name = name.to_owned();
        Reactor::current().schedule(move || callback(client.call(&name, args)));
    }

    /// Registers a local callback for `key` and subscribes on the server.
    /// Subscribing the same key twice is a programming error.
    pub fn subscribe(&self, key: &str, callback: impl Fn(&mut Serializer) + Send + Sync + 'static) {
        self.subscriptions.with(|subs| {
            let replaced = subs.insert(key.to_owned(), Box::new(callback));
            assert!(replaced.is_none(), "duplicate subscription for key {key}");
        });
        let mut s = Serializer::new();
        s.write(key);
        s.reset();
        self.post(Frame::new(MessageType::RpcSubscribeRequest, s.to_bytes(), 0));
    }

    /// Queues a frame for the send fiber; silently dropped once closed.
    pub(crate) fn post(&self, frame: Frame) {
        // Cloned out of the lock: a full channel parks the calling fiber.
        let outbound = self.outbound.read().expect("client outbound lock").clone();
        if let Some(outbound) = outbound {
            outbound.send(frame);
        }
    }

    /// Performs one method call from an already serialized
    /// (name, arguments) payload.
    pub(crate) fn call_payload<R: Decode + Default>(&self, payload: Vec<u8>) -> RpcResult<R> {
        if self.is_closed() {
            return RpcResult::error(RpcCode::Closed, "socket closed");
        }

        let reply = Channel::new(1);
        let id = self.sequence_id.fetch_add(1, Ordering::AcqRel);
        self.pending.with(|pending| pending.insert(id, reply.clone()));

        self.post(Frame::new(MessageType::RpcMethodRequest, payload, id));

        // The timeout closes the reply channel; a response racing the
        // timeout is dropped and the caller still observes TIMEOUT.
        let witness = Arc::new(CallCancelled { timed_out: AtomicBool::new(false) });
        let timeout_ms = self.timeout_ms.load(Ordering::Acquire);
        let timer = if timeout_ms != net::NO_TIMEOUT {
            let weak = Arc::downgrade(&witness);
            let cancel = reply.clone();
            Some(Reactor::current().add_condition_timer(
                timeout_ms,
                move || {
                    let Some(witness) = weak.upgrade() else { return };
                    witness.timed_out.store(true, Ordering::Release);
                    cancel.close();
                },
                Arc::downgrade(&witness),
                false,
            ))
        } else {
            None
        };

        let response = reply.recv();
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.pending.with(|pending| pending.remove(&id));

        if witness.timed_out.load(Ordering::Acquire) {
            return RpcResult::error(RpcCode::Timeout, "call timeout");
        }
        let Some(response) = response else {
            return RpcResult::error(RpcCode::Closed, "socket closed");
        };
        if response.payload.is_empty() {
            return RpcResult::error(RpcCode::NoMethod, "method not found");
        }
        let mut s = Serializer::from_bytes(&response.payload);
        match s.read::<RpcResult<R>>() {
            Ok(result) => result,
            Err(err) => {
                log::debug!(target: "fibernet::client", "response decode failed: {err}");
                RpcResult::error(RpcCode::NoMatch, "return value not match")
            }
        }
    }

    /// Send fiber: drains the outbound channel in order until it closes.
    fn handle_send(self: Arc<Self>) {
        let Some(outbound) = self.outbound.read().expect("client outbound lock").clone() else {
            return;
        };
        let Some(session) = self.session.read().expect("client session lock").clone() else {
            return;
        };
        while let Some(frame) = outbound.recv() {
            if let Err(err) = session.send(&frame) {
                log::warn!(target: "fibernet::client", "send failed: {err}");
            }
        }
        log::trace!(target: "fibernet::client", "send fiber finished");
    }

    /// Receive fiber: routes every inbound frame until the session dies.
    fn handle_recv(self: Arc<Self>) {
        let Some(session) = self.session.read().expect("client session lock").clone() else {
            return;
        };
        while let Some(frame) = session.recv() {
            self.heart_overdue.store(false, Ordering::Release);
            match frame.message_type {
                MessageType::HeartbeatPacket => {}
                MessageType::RpcMethodResponse => self.handle_method_response(frame),
                MessageType::RpcPublishRequest => {
                    self.handle_publish(&frame);
                    self.post(Frame::new(MessageType::RpcPublishResponse, Vec::new(), 0));
                }
                MessageType::RpcSubscribeResponse => {}
                other => {
                    log::trace!(target: "fibernet::client", "ignoring {other} frame");
                }
            }
        }
        log::debug!(target: "fibernet::client", "server connection lost");
        self.close();
    }

    fn handle_method_response(&self, frame: Frame) {
        let id = frame.sequence_id;
        let channel = self.pending.with(|pending| pending.get(&id).cloned());
        match channel {
            // A send on a closed channel (timed-out call) drops the frame.
            Some(channel) => {
                channel.send(frame);
            }
            None => {
                log::trace!(target: "fibernet::client", "reply {id} has no pending call");
            }
        }
    }

    fn handle_publish(&self, frame: &Frame) {
        let mut s = Serializer::from_bytes(&frame.payload);
        let key: String = match s.read() {
            Ok(key) => key,
            Err(err) => {
                log::warn!(target: "fibernet::client", "malformed publish frame: {err}");
                return;
            }
        };
        self.subscriptions.with(|subs| {
            if let Some(callback) = subs.get(&key) {
                callback(&mut s);
            }
        });
    }

    /// One heartbeat period: if the previous probe went unanswered the
    /// server is declared dead; otherwise a new probe is queued.
    fn heartbeat_tick(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.heart_overdue.load(Ordering::Acquire) {
            log::warn!(
                target: "fibernet::client",
                "server {:?} missed a heartbeat; closing", self.peer_addr()
            );
            self.close();
            return;
        }
        self.post(Frame::heartbeat());
        self.heart_overdue.store(true, Ordering::Release);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) { self.close() }
}
