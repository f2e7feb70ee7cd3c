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

//! RPC server: named handlers, call dispatch, pub/sub fan-out and registry
//! heartbeating.
//!
//! Handlers are registered under a method name before [`RpcServer::start`];
//! each inbound method request is dispatched on the worker reactor and
//! answered with a serialized [`RpcResult`] under the request's sequence
//! id. When a registry is configured the server announces itself as a
//! provider, registers every handler and keeps a 30-second heartbeat; a
//! missed reply abandons the registry while local serving continues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, RwLock, Weak};

use fiber::config::{self, ConfigVar};
use fiber::net::TcpStream;
use fiber::sync::Channel;
use fiber::{Reactor, Timer};

use crate::guarded::Guarded;
use crate::protocol::{Frame, MessageType};
use crate::rpc::{RpcCode, RpcResult};
use crate::serialize::{Decode, Encode, Serializer};
use crate::session::RpcSession;
use crate::tcp::{BindError, ServiceDelegate, TcpServer};

/// Interval of the registry heartbeat.
const REGISTRY_HEARTBEAT_MS: u64 = 30_000;
/// Period of the dead-subscriber cleaner.
const CLEANER_MS: u64 = 5000;

static HEARTBEAT_TIMEOUT: LazyLock<Arc<ConfigVar<u64>>> = LazyLock::new(|| {
    config::lookup(
        "rpc.server.heartbeat_timeout",
        40_000,
        "rpc server per-connection idle timeout (ms)",
    )
});

type MethodHandler = Box<dyn Fn(&mut Serializer) -> Serializer + Send + Sync>;

/// Server half of the RPC fabric.
pub struct RpcServer {
    tcp: TcpServer,
    handlers: RwLock<HashMap<String, MethodHandler>>,
    registry: StdMutex<Option<Arc<RpcSession>>>,
    heart_timer: StdMutex<Option<Timer>>,
    cleaner_timer: StdMutex<Option<Timer>>,
    subscribers: Guarded<HashMap<String, Vec<Weak<RpcSession>>>>,
    port: AtomicU32,
    stop_cleaner: AtomicBool,
    cleaner_done: Channel<bool>,
}

impl RpcServer {
    /// A server running accept, I/O and dispatch on one reactor.
    pub fn new(reactor: Arc<Reactor>) -> Arc<RpcServer> {
        Self::with_reactors("RpcServer", reactor.clone(), reactor.clone(), reactor)
    }

    /// A server with segregated accept / per-connection I/O / dispatch
    /// pools.
    pub fn with_reactors(
        name: &str,
        accept: Arc<Reactor>,
        io: Arc<Reactor>,
        worker: Arc<Reactor>,
    ) -> Arc<RpcServer> {
        Arc::new(RpcServer {
            tcp: TcpServer::new(name, accept, io, worker),
            handlers: RwLock::new(empty!()),
            registry: StdMutex::new(None),
            heart_timer: StdMutex::new(None),
            cleaner_timer: StdMutex::new(None),
            subscribers: Guarded::new(empty!()),
            port: AtomicU32::new(0),
            stop_cleaner: AtomicBool::new(false),
            cleaner_done: Channel::new(1),
        })
    }

    /// Registers `handler` under `name`. The handler's argument tuple is
    /// deserialized from the request; a mismatch yields NO_MATCH to the
    /// caller. Must happen before [`Self::start`].
    pub fn register<A, R, F>(&self, name: &str, handler: F)
    where
        A: Decode,
        R: Encode + Default,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let method = name.to_owned();
        let dispatcher = move |request: &mut Serializer| -> Serializer {
            let mut response = Serializer::new();
            match request.read::<A>() {
                Ok(args) => response.write(&RpcResult::success(handler(args))),
                Err(err) => {
                    log::debug!(
                        target: "fibernet::server",
                        "arguments of {method} did not deserialize: {err}"
                    );
                    response.write(&RpcResult::<R>::error(RpcCode::NoMatch, "params not match"));
                }
            }
            response.reset();
            response
        };
        self.handlers
            .write()
            .expect("server handler lock")
            .insert(name.to_owned(), Box::new(dispatcher));
    }

    /// Binds the listening address.
    pub fn bind(&self, addr: SocketAddr) -> Result<(), BindError> {
        self.bind_all(&[addr])
    }

    /// Binds several listening addresses; all-or-nothing.
    pub fn bind_all(&self, addrs: &[SocketAddr]) -> Result<(), BindError> {
        self.tcp.bind(addrs)?;
        let port = self.tcp.local_addrs().first().map(|addr| addr.port()).unwrap_or_default();
        self.port.store(port as u32, Ordering::Release);
        Ok(())
    }

    /// Bound listening addresses.
    pub fn local_addrs(&self) -> Vec<SocketAddr> { self.tcp.local_addrs() }

    /// Connects to the registry and announces this server as a provider of
    /// its listening port. Must run on a reactor fiber, after
    /// [`Self::bind`].
    pub fn bind_registry(&self, addr: SocketAddr) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout_ms(REGISTRY_HEARTBEAT_MS);
        let session = Arc::new(RpcSession::new(stream));

        let mut s = Serializer::new();
        s.write(&self.port.load(Ordering::Acquire));
        s.reset();
        session.send(&Frame::new(MessageType::RpcProvider, s.to_bytes(), 0))?;
        *self.registry.lock().expect("server registry lock") = Some(session);
        log::info!(target: "fibernet::server", "{} announced to registry {addr}", self.tcp.name());
        Ok(())
    }

    /// Starts serving: registers handlers with the registry (when bound),
    /// arms the registry heartbeat and the subscriber cleaner, and begins
    /// accepting. Must run on a reactor fiber.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let registry = self.registry.lock().expect("server registry lock").clone();
        if let Some(registry) = registry {
            let names: Vec<String> =
                self.handlers.read().expect("server handler lock").keys().cloned().collect();
            for name in names {
                self.register_service(&registry, &name);
            }

            let weak = Arc::downgrade(self);
            let timer = self.tcp.worker_reactor().add_timer(
                REGISTRY_HEARTBEAT_MS,
                move || {
                    let Some(server) = weak.upgrade() else { return };
                    server.registry_heartbeat();
                },
                true,
            );
            *self.heart_timer.lock().expect("server heart lock") = Some(timer);
        }

        let weak = Arc::downgrade(self);
        let cleaner = self.tcp.worker_reactor().add_timer(
            CLEANER_MS,
            move || {
                let Some(server) = weak.upgrade() else { return };
                server.clean_subscribers();
            },
            true,
        );
        *self.cleaner_timer.lock().expect("server cleaner lock") = Some(cleaner);

        self.tcp.start(self.clone())
    }

    /// Stops accepting, hands the cleaner its stop signal and closes the
    /// registry link. Must run on a reactor fiber.
    pub fn stop(&self) {
        self.tcp.stop();
        self.stop_cleaner.store(true, Ordering::Release);
        self.cleaner_done.recv();
        if let Some(timer) = self.cleaner_timer.lock().expect("server cleaner lock").take() {
            timer.cancel();
        }
        if let Some(timer) = self.heart_timer.lock().expect("server heart lock").take() {
            timer.cancel();
        }
        if let Some(registry) = self.registry.lock().expect("server registry lock").take() {
            registry.close();
        }
    }

    /// Publishes `data` to every live subscriber of `key`.
    pub fn publish<T: Encode>(&self, key: &str, data: T) {
        let sessions = self.subscribers.with(|subs| match subs.get(key) {
            Some(entries) => entries.iter().filter_map(Weak::upgrade).collect(),
            None => Vec::new(),
        });
        if sessions.is_empty() {
            return;
        }
        let mut s = Serializer::new();
        s.write(key);
        s.write(&data);
        s.reset();
        let frame = Frame::new(MessageType::RpcPublishRequest, s.to_bytes(), 0);
        for session in sessions {
            if session.is_connected() {
                let _ = session.send(&frame);
            }
        }
    }

    fn register_service(&self, registry: &RpcSession, name: &str) {
        let mut s = Serializer::new();
        s.write(name);
        s.reset();
        if registry.send(&Frame::new(MessageType::RpcServiceRegister, s.to_bytes(), 0)).is_err() {
            log::warn!(target: "fibernet::server", "register service {name}: registry unreachable");
            return;
        }
        let Some(response) = registry.recv() else {
            log::warn!(
                target: "fibernet::server",
                "register service {name} failed on {:?}", registry.peer_addr()
            );
            return;
        };
        let mut s = Serializer::from_bytes(&response.payload);
        match s.read::<RpcResult<String>>() {
            Ok(result) if result.is_ok() => {
                log::info!(target: "fibernet::server", "registered service {}", result.value());
            }
            Ok(result) => {
                log::warn!(
                    target: "fibernet::server",
                    "registry rejected service {name}: {}", result.message()
                );
            }
            Err(err) => {
                log::warn!(target: "fibernet::server", "malformed register response: {err}");
            }
        }
    }

    /// One registry heartbeat: probe and await the echo; a silent registry
    /// is abandoned while local serving continues.
    fn registry_heartbeat(&self) {
        let registry = self.registry.lock().expect("server registry lock").clone();
        let Some(registry) = registry else { return };
        let alive = registry.send(&Frame::heartbeat()).is_ok() && registry.recv().is_some();
        if !alive {
            log::warn!(target: "fibernet::server", "registry closed; serving standalone");
            if let Some(timer) = self.heart_timer.lock().expect("server heart lock").take() {
                timer.cancel();
            }
            registry.close();
            *self.registry.lock().expect("server registry lock") = None;
        }
    }

    /// Cleaner pass: prune dead weak sessions; after a stop request, signal
    /// completion instead.
    fn clean_subscribers(&self) {
        if self.stop_cleaner.load(Ordering::Acquire) {
            self.cleaner_done.send(true);
            return;
        }
        self.subscribers.with(|subs| {
            subs.retain(|_, entries| {
                entries.retain(|session| {
                    session.upgrade().map(|session| session.is_connected()).unwrap_or(false)
                });
                !entries.is_empty()
            });
        });
    }

    fn handle_method_call(&self, frame: &Frame) -> Frame {
        let mut request = Serializer::from_bytes(&frame.payload);
        let payload = match request.read::<String>() {
            Ok(name) => {
                let handlers = self.handlers.read().expect("server handler lock");
                match handlers.get(&name) {
                    // A missing method answers with an empty payload.
                    None => Vec::new(),
                    Some(dispatcher) => dispatcher(&mut request).to_bytes(),
                }
            }
            Err(err) => {
                log::debug!(target: "fibernet::server", "malformed method request: {err}");
                Vec::new()
            }
        };
        Frame::new(MessageType::RpcMethodResponse, payload, frame.sequence_id)
    }

    fn handle_subscribe(&self, frame: &Frame, session: &Arc<RpcSession>) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.payload);
        let key: String = match s.read() {
            Ok(key) => key,
            Err(err) => {
                log::warn!(target: "fibernet::server", "malformed subscribe request: {err}");
                return None;
            }
        };
        self.subscribers
            .with(|subs| subs.entry(key).or_default().push(Arc::downgrade(session)));
        let mut response = Serializer::new();
        response.write(&RpcResult::success(()));
        response.reset();
        Some(Frame::new(MessageType::RpcSubscribeResponse, response.to_bytes(), 0))
    }

    fn watchdog(&self, session: &Arc<RpcSession>, slot: &mut Option<Timer>) {
        match slot {
            Some(timer) => {
                timer.reset(HEARTBEAT_TIMEOUT.get(), true);
            }
            None => {
                let session = session.clone();
                *slot = Some(self.tcp.worker_reactor().add_timer(
                    HEARTBEAT_TIMEOUT.get(),
                    move || {
                        log::debug!(
                            target: "fibernet::server",
                            "client {:?} idle past deadline; closing", session.peer_addr()
                        );
                        session.close();
                    },
                    true,
                ));
            }
        }
    }
}

impl ServiceDelegate for RpcServer {
    /// Per-connection loop: frames are dispatched as worker fibers; a
    /// watchdog closes sockets idle past the heartbeat deadline.
    fn handle_client(self: Arc<Self>, stream: fiber::net::TcpStream) {
        let session = Arc::new(RpcSession::new(stream));
        let mut watchdog = None;
        self.watchdog(&session, &mut watchdog);

        while let Some(frame) = session.recv() {
            self.watchdog(&session, &mut watchdog);
            let server = self.clone();
            let session = session.clone();
            self.tcp.worker_reactor().schedule(move || {
                let response = match frame.message_type {
                    MessageType::HeartbeatPacket => Some(Frame::heartbeat()),
                    MessageType::RpcMethodRequest => Some(server.handle_method_call(&frame)),
                    MessageType::RpcSubscribeRequest => {
                        server.handle_subscribe(&frame, &session)
                    }
                    MessageType::RpcPublishResponse => None,
                    other => {
                        log::debug!(target: "fibernet::server", "ignoring {other} frame");
                        None
                    }
                };
                if let Some(response) = response {
                    let _ = session.send(&response);
                }
            });
        }

        if let Some(watchdog) = watchdog {
            watchdog.cancel();
        }
        session.close();
    }
}
