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

//! Registry-aware connection pool.
//!
//! The pool multiplexes calls by service name: it keeps a live
//! [`RpcClient`] and an address cache per service, discovers providers from
//! the registry on cache misses, and subscribes to service up/down deltas
//! so the cache follows the mesh. Dead clients (CLOSED calls) are evicted
//! together with their cached address before the call is retried against a
//! freshly routed provider.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, RwLock};

use fiber::config::{self, ConfigVar};
use fiber::net::TcpStream;
use fiber::sync::Channel;
use fiber::{Reactor, Timer};

use crate::client::{RpcClient, SubscribeCallback};
use crate::guarded::Guarded;
use crate::protocol::{Frame, MessageType};
use crate::route::{select_engine, RouteStrategy, Strategy};
use crate::rpc::{RpcCode, RpcResult, SERVICE_SUBSCRIBE};
use crate::serialize::{Decode, Encode, Serializer};
use crate::session::RpcSession;

/// Interval of the registry heartbeat.
const HEARTBEAT_MS: u64 = 30_000;

static CHANNEL_CAPACITY: LazyLock<Arc<ConfigVar<u64>>> = LazyLock::new(|| {
    config::lookup(
        "rpc.connection_pool.channel_capacity",
        1024,
        "rpc connection pool outbound channel capacity",
    )
});

#[derive(Default)]
struct PoolState {
    /// service name → cached provider addresses.
    addresses: HashMap<String, Vec<String>>,
    /// service name → live client.
    clients: HashMap<String, Arc<RpcClient>>,
}

/// Service-mesh client multiplexer.
pub struct ConnectionPool {
    closed: AtomicBool,
    heart_overdue: AtomicBool,
    timeout_ms: u64,
    strategy: Strategy,
    route: StdMutex<Option<Box<dyn RouteStrategy>>>,
    registry: RwLock<Option<Arc<RpcSession>>>,
    outbound: RwLock<Option<Channel<Frame>>>,
    state: Guarded<PoolState>,
    discover_pending: Guarded<HashMap<String, Channel<Frame>>>,
    subscriptions: Guarded<HashMap<String, SubscribeCallback>>,
    heart_timer: StdMutex<Option<Timer>>,
}

impl ConnectionPool {
    /// A disconnected pool dialing providers with `timeout_ms` and routing
    /// with `strategy`.
    pub fn new(timeout_ms: u64, strategy: Strategy) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool {
            closed: AtomicBool::new(true),
            heart_overdue: AtomicBool::new(false),
            timeout_ms,
            strategy,
            route: StdMutex::new(None),
            registry: RwLock::new(None),
            outbound: RwLock::new(None),
            state: Guarded::new(PoolState::default()),
            discover_pending: Guarded::new(empty!()),
            subscriptions: Guarded::new(empty!()),
            heart_timer: StdMutex::new(None),
        })
    }

    /// Connects to the registry and starts the send/receive fibers. Must
    /// run on a reactor fiber.
    pub fn connect(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let reactor = Reactor::current();
        let stream = TcpStream::connect_timeout(addr, self.timeout_ms)?;
        let session = Arc::new(RpcSession::new(stream));

        // HashIp keys route selection by this pool's own address.
        let hash_key =
            session.local_addr().map(|a| a.ip().to_string()).unwrap_or_default();
        *self.route.lock().expect("pool route lock") =
            Some(select_engine(self.strategy, &hash_key));

        *self.registry.write().expect("pool registry lock") = Some(session);
        let outbound = Channel::new(CHANNEL_CAPACITY.get() as usize);
        *self.outbound.write().expect("pool outbound lock") = Some(outbound);
        self.closed.store(false, Ordering::Release);
        self.heart_overdue.store(false, Ordering::Release);
        log::debug!(target: "fibernet::pool", "connected to registry {addr}");

        let recv = self.clone();
        reactor.schedule(move || recv.handle_recv());
        let send = self.clone();
        reactor.schedule(move || send.handle_send());

        let weak = Arc::downgrade(self);
        let timer = reactor.add_timer(
            HEARTBEAT_MS,
            move || {
                let Some(pool) = weak.upgrade() else { return };
                pool.heartbeat_tick();
            },
            true,
        );
        *self.heart_timer.lock().expect("pool heart lock") = Some(timer);
        Ok(())
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Drops the registry link and every pooled client. Pending discovery
    /// waiters wake and observe the closure.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!(target: "fibernet::pool", "closing connection pool");
        let outbound = self.outbound.read().expect("pool outbound lock").clone();
        if let Some(outbound) = outbound {
            outbound.close();
        }
        let pending = self.discover_pending.with(std::mem::take);
        for (_, channel) in pending {
            channel.close();
        }
        if let Some(timer) = self.heart_timer.lock().expect("pool heart lock").take() {
            timer.cancel();
        }
        let clients = self.state.with(|state| {
            state.addresses.clear();
            std::mem::take(&mut state.clients)
        });
        for (_, client) in clients {
            client.close();
        }
        if let Some(session) = self.registry.read().expect("pool registry lock").as_ref() {
            session.close();
        }
    }

    /// Cached provider addresses of `service` (testing and diagnostics).
    pub fn cached_providers(&self, service: &str) -> Vec<String> {
        self.state.with(|state| state.addresses.get(service).cloned().unwrap_or_default())
    }

    /// Calls `name` on some provider of the service, discovering and
    /// dialing as needed.
    pub fn call<R, A>(self: &Arc<Self>, name: &str, args: A) -> RpcResult<R>
    where
        R: Decode + Default,
        A: Encode,
    {
        let mut s = Serializer::new();
        s.write(name);
        s.write(&args);
        s.reset();
        let payload = s.to_bytes();

        // A cached live client first; a CLOSED reply evicts it and its
        // address, then falls through to rerouting.
        let cached = self.state.with(|state| state.clients.get(name).cloned());
        if let Some(client) = cached {
            let result = client.call_payload(payload.clone());
            if result.code() != RpcCode::Closed {
                return result;
            }
            let dead = client.peer_addr().map(|a| a.to_string());
            self.state.with(|state| {
                if let (Some(dead), Some(list)) = (&dead, state.addresses.get_mut(name)) {
                    list.retain(|a| a != dead);
                }
                state.clients.remove(name);
            });
        }

        let mut addresses = self.cached_providers(name);
        if addresses.is_empty() {
            if !self.registry_connected() {
                return RpcResult::error(RpcCode::Closed, "registry closed");
            }
            addresses = self.discover(name);
            if addresses.is_empty() {
                return RpcResult::error(RpcCode::NoMethod, format!("no method: {name}"));
            }
            self.state
                .with(|state| state.addresses.insert(name.to_owned(), addresses.clone()));
        }

        let choice = {
            let mut route = self.route.lock().expect("pool route lock");
            let engine = route.as_mut().expect("route engine exists after connect");
            engine.select(&addresses).clone()
        };
        if let Ok(addr) = choice.parse::<SocketAddr>() {
            let client = RpcClient::new(true);
            if client.connect(addr).is_ok() {
                self.state
                    .with(|state| state.clients.insert(name.to_owned(), client.clone()));
                return client.call_payload(payload);
            }
            log::warn!(target: "fibernet::pool", "provider {choice} is unreachable");
        }
        RpcResult::error(RpcCode::Fail, "call fail")
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
        let pool = self.clone();
        let name = name.to_owned();
        Reactor::current().schedule(move || {
            result.send(pool.call(&name, args));
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
        let pool = self.clone();
        let name = name.to_owned();
        Reactor::current().schedule(move || callback(pool.call(&name, args)));
    }

    /// Asks the registry for the providers of `name`, blocking the calling
    /// fiber for the response. The first successful discovery additionally
    /// subscribes to the service's up/down deltas.
    pub fn discover(self: &Arc<Self>, name: &str) -> Vec<String> {
        if !self.registry_connected() {
            return Vec::new();
        }

        let reply = Channel::new(1);
        self.discover_pending.with(|pending| pending.insert(name.to_owned(), reply.clone()));

        let mut s = Serializer::new();
        s.write(name);
        s.reset();
        self.post(Frame::new(MessageType::RpcServiceDiscover, s.to_bytes(), 0));

        let response = reply.recv();
        self.discover_pending.with(|pending| pending.remove(name));
        let Some(response) = response else { return Vec::new() };

        let mut s = Serializer::from_bytes(&response.payload);
        let parsed: Result<Vec<RpcResult<String>>, _> = (|| {
            let _service: String = s.read()?;
            let count: u32 = s.read()?;
            (0..count).map(|_| s.read::<RpcResult<String>>()).collect()
        })();
        let results = match parsed {
            Ok(results) => results,
            Err(err) => {
                log::warn!(target: "fibernet::pool", "malformed discover response: {err}");
                return Vec::new();
            }
        };
        match results.first() {
            None => return Vec::new(),
            Some(first) if first.code() == RpcCode::NoMethod => return Vec::new(),
            Some(_) => {}
        }
        let addresses: Vec<String> =
            results.into_iter().map(RpcResult::into_value).collect();

        let key = format!("{SERVICE_SUBSCRIBE}{name}");
        let subscribed = self.subscriptions.with(|subs| subs.contains_key(&key));
        if !subscribed {
            let weak = Arc::downgrade(self);
            let service = name.to_owned();
            self.subscribe(&key, move |s| {
                let Some(pool) = weak.upgrade() else { return };
                let (is_up, address): (bool, String) = match (s.read(), s.read()) {
                    (Ok(is_up), Ok(address)) => (is_up, address),
                    _ => {
                        log::warn!(target: "fibernet::pool", "malformed service delta");
                        return;
                    }
                };
                pool.state.with(|state| {
                    if is_up {
                        log::debug!(
                            target: "fibernet::pool",
                            "service [ {service} : {address} ] joined"
                        );
                        state.addresses.entry(service.clone()).or_default().push(address);
                    } else {
                        log::debug!(
                            target: "fibernet::pool",
                            "service [ {service} : {address} ] quit"
                        );
                        if let Some(list) = state.addresses.get_mut(&service) {
                            list.retain(|a| a != &address);
                        }
                    }
                });
            });
        }
        addresses
    }

    /// Registers a local callback for `key` and subscribes at the
    /// registry. Subscribing the same key twice is a programming error.
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

    fn registry_connected(&self) -> bool {
        self.registry
            .read()
            .expect("pool registry lock")
            .as_ref()
            .map(|session| session.is_connected())
            .unwrap_or(false)
    }

    fn post(&self, frame: Frame) {
        // Cloned out of the lock: a full channel parks the calling fiber.
        let outbound = self.outbound.read().expect("pool outbound lock").clone();
        if let Some(outbound) = outbound {
            outbound.send(frame);
        }
    }

    fn handle_send(self: Arc<Self>) {
        let Some(outbound) = self.outbound.read().expect("pool outbound lock").clone() else {
            return;
        };
        let Some(session) = self.registry.read().expect("pool registry lock").clone() else {
            return;
        };
        while let Some(frame) = outbound.recv() {
            if let Err(err) = session.send(&frame) {
                log::warn!(target: "fibernet::pool", "send to registry failed: {err}");
            }
        }
        log::trace!(target: "fibernet::pool", "send fiber finished");
    }

    fn handle_recv(self: Arc<Self>) {
        let Some(session) = self.registry.read().expect("pool registry lock").clone() else {
            return;
        };
        while let Some(frame) = session.recv() {
            self.heart_overdue.store(false, Ordering::Release);
            match frame.message_type {
                MessageType::HeartbeatPacket => {}
                MessageType::RpcServiceDiscoverResponse => self.handle_discover_response(frame),
                MessageType::RpcPublishRequest => {
                    self.handle_publish(&frame);
                    self.post(Frame::new(MessageType::RpcPublishResponse, Vec::new(), 0));
                }
                MessageType::RpcSubscribeResponse => {}
                other => {
                    log::trace!(target: "fibernet::pool", "ignoring {other} frame");
                }
            }
        }
        log::debug!(target: "fibernet::pool", "registry connection lost");
        self.close();
    }

    /// Discover responses are correlated by service name, not sequence id.
    fn handle_discover_response(&self, frame: Frame) {
        let mut s = Serializer::from_bytes(&frame.payload);
        let service: String = match s.read() {
            Ok(service) => service,
            Err(err) => {
                log::warn!(target: "fibernet::pool", "malformed discover response: {err}");
                return;
            }
        };
        let channel = self.discover_pending.with(|pending| pending.get(&service).cloned());
        if let Some(channel) = channel {
            channel.send(frame);
        }
    }

    fn handle_publish(&self, frame: &Frame) {
        let mut s = Serializer::from_bytes(&frame.payload);
        let key: String = match s.read() {
            Ok(key) => key,
            Err(err) => {
                log::warn!(target: "fibernet::pool", "malformed publish frame: {err}");
                return;
            }
        };
        self.subscriptions.with(|subs| {
            if let Some(callback) = subs.get(&key) {
                callback(&mut s);
            }
        });
    }

    /// One heartbeat period: a silent registry is abandoned, but cached
    /// routes keep serving calls.
    fn heartbeat_tick(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.heart_overdue.load(Ordering::Acquire) {
            log::warn!(target: "fibernet::pool", "registry missed a heartbeat; dropping it");
            if let Some(timer) = self.heart_timer.lock().expect("pool heart lock").take() {
                timer.cancel();
            }
            return;
        }
        self.post(Frame::heartbeat());
        self.heart_overdue.store(true, Ordering::Release);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) { self.close() }
}
