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

//! RPC service registry.
//!
//! Providers announce themselves with their listening port, register
//! service names, and are health-checked per session; consumers discover
//! provider address lists and may subscribe to service up/down deltas,
//! published under the [`SERVICE_SUBSCRIBE`] key prefix. The forward
//! service→providers multimap is paired with an inverse provider→services
//! index, which is the authoritative view for disconnect cleanup: when a
//! provider session dies, every service it registered is removed and a
//! single "down" delta is published per service.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex as StdMutex, Weak};

use fiber::config::{self, ConfigVar};
use fiber::sync::Channel;
use fiber::{Reactor, Timer};

use crate::guarded::Guarded;
use crate::protocol::{Frame, MessageType};
use crate::rpc::{RpcCode, RpcResult, SERVICE_SUBSCRIBE};
use crate::serialize::{Encode, Serializer};
use crate::session::RpcSession;
use crate::tcp::{BindError, ServiceDelegate, TcpServer};

/// Period of the dead-subscriber cleaner.
const CLEANER_MS: u64 = 5000;

static HEARTBEAT_TIMEOUT: LazyLock<Arc<ConfigVar<u64>>> = LazyLock::new(|| {
    config::lookup(
        "rpc.registry.heartbeat_timeout",
        40_000,
        "rpc registry per-connection idle timeout (ms)",
    )
});

#[derive(Default)]
struct ServiceMaps {
    /// service name → provider addresses (duplicates allowed).
    forward: HashMap<String, Vec<String>>,
    /// provider address → service names it registered; one entry here
    /// references exactly one entry in `forward`.
    inverse: HashMap<String, Vec<String>>,
}

/// The service registry server.
pub struct RpcRegistry {
    tcp: TcpServer,
    services: Guarded<ServiceMaps>,
    subscribers: Guarded<HashMap<String, Vec<Weak<RpcSession>>>>,
    cleaner_timer: StdMutex<Option<Timer>>,
    stop_cleaner: AtomicBool,
    cleaner_done: Channel<bool>,
}

impl RpcRegistry {
    pub fn new(reactor: Arc<Reactor>) -> Arc<RpcRegistry> {
        Arc::new(RpcRegistry {
            tcp: TcpServer::with_reactor("RpcRegistry", reactor),
            services: Guarded::new(ServiceMaps::default()),
            subscribers: Guarded::new(empty!()),
            cleaner_timer: StdMutex::new(None),
            stop_cleaner: AtomicBool::new(false),
            cleaner_done: Channel::new(1),
        })
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<(), BindError> { self.tcp.bind(&[addr]) }

    pub fn local_addrs(&self) -> Vec<SocketAddr> { self.tcp.local_addrs() }

    /// Starts the accept loop and the subscriber cleaner. Must run on a
    /// reactor fiber.
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let weak = Arc::downgrade(self);
        let cleaner = self.tcp.worker_reactor().add_timer(
            CLEANER_MS,
            move || {
                let Some(registry) = weak.upgrade() else { return };
                registry.clean_subscribers();
            },
            true,
        );
        *self.cleaner_timer.lock().expect("registry cleaner lock") = Some(cleaner);
        self.tcp.start(self.clone())
    }

    /// Stops accepting and joins the cleaner. Must run on a reactor fiber.
    pub fn stop(&self) {
        self.tcp.stop();
        self.stop_cleaner.store(true, Ordering::Release);
        self.cleaner_done.recv();
        if let Some(timer) = self.cleaner_timer.lock().expect("registry cleaner lock").take() {
            timer.cancel();
        }
    }

    /// Providers currently registered for `service`.
    pub fn providers(&self, service: &str) -> Vec<String> {
        self.services.with(|maps| maps.forward.get(service).cloned().unwrap_or_default())
    }

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

    /// Publishes `data` to every live subscriber of `key`.
    fn publish<T: Encode>(&self, key: &str, data: T) {
        let sessions: Vec<Arc<RpcSession>> = self.subscribers.with(|subs| match subs.get(key) {
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

    /// Records the provider's canonical address: its peer IP combined with
    /// the announced listening port.
    fn handle_provider(&self, frame: &Frame, session: &RpcSession) -> Option<String> {
        let mut s = Serializer::from_bytes(&frame.payload);
        let port: u32 = match s.read() {
            Ok(port) => port,
            Err(err) => {
                log::warn!(target: "fibernet::registry", "malformed provider frame: {err}");
                return None;
            }
        };
        let peer = session.peer_addr()?;
        let address = format!("{}:{port}", peer.ip());
        log::debug!(target: "fibernet::registry", "provider announced at {address}");
        Some(address)
    }

    /// Registers one service for a provider and publishes its "up" delta.
    fn handle_register(&self, frame: &Frame, provider: Option<&String>) -> Frame {
        let mut s = Serializer::from_bytes(&frame.payload);
        let name: String = match s.read() {
            Ok(name) => name,
            Err(_) => {
                let mut response = Serializer::new();
                response
                    .write(&RpcResult::<String>::error(RpcCode::Fail, "malformed service name"));
                response.reset();
                return Frame::new(
                    MessageType::RpcServiceRegisterResponse,
                    response.to_bytes(),
                    0,
                );
            }
        };
        let Some(address) = provider else {
            let mut response = Serializer::new();
            response.write(&RpcResult::<String>::error(
                RpcCode::Fail,
                "session has not announced a provider port",
            ));
            response.reset();
            return Frame::new(MessageType::RpcServiceRegisterResponse, response.to_bytes(), 0);
        };

        self.services.with(|maps| {
            maps.forward.entry(name.clone()).or_default().push(address.clone());
            maps.inverse.entry(address.clone()).or_default().push(name.clone());
        });
        log::info!(target: "fibernet::registry", "service [ {name} : {address} ] registered");

        // "up" goes out only after the forward-map insertion.
        self.publish(&format!("{SERVICE_SUBSCRIBE}{name}"), (true, address.clone()));

        let mut response = Serializer::new();
        response.write(&RpcResult::success(name));
        response.reset();
        Frame::new(MessageType::RpcServiceRegisterResponse, response.to_bytes(), 0)
    }

    /// Removes every service of a disconnected provider, publishing one
    /// "down" delta per service.
    fn handle_unregister(&self, address: &str) {
        let removed = self.services.with(|maps| {
            let Some(names) = maps.inverse.remove(address) else { return Vec::new() };
            for name in &names {
                if let Some(providers) = maps.forward.get_mut(name) {
                    if let Some(index) = providers.iter().position(|a| a == address) {
                        providers.remove(index);
                    }
                    if providers.is_empty() {
                        maps.forward.remove(name);
                    }
                }
            }
            names
        });
        for name in removed {
            log::info!(target: "fibernet::registry", "service [ {name} : {address} ] went down");
            self.publish(&format!("{SERVICE_SUBSCRIBE}{name}"), (false, address.to_owned()));
        }
    }

    /// Builds the discover response: the service name, a count, then one
    /// result per provider — or a single NO_METHOD result for unknown
    /// services.
    fn handle_discover(&self, frame: &Frame) -> Frame {
        let mut s = Serializer::from_bytes(&frame.payload);
        let name: String = s.read().unwrap_or_default();
        let providers = self.providers(&name);

        let mut response = Serializer::new();
        response.write(&name);
        if providers.is_empty() {
            response.write(&1u32);
            response.write(&RpcResult::<String>::error(
                RpcCode::NoMethod,
                format!("discover service: {name}"),
            ));
        } else {
            response.write(&(providers.len() as u32));
            for address in providers {
                response.write(&RpcResult::success(address));
            }
        }
        response.reset();
        Frame::new(MessageType::RpcServiceDiscoverResponse, response.to_bytes(), 0)
    }

    fn handle_subscribe(&self, frame: &Frame, session: &Arc<RpcSession>) -> Option<Frame> {
        let mut s = Serializer::from_bytes(&frame.payload);
        let key: String = match s.read() {
            Ok(key) => key,
            Err(err) => {
                log::warn!(target: "fibernet::registry", "malformed subscribe request: {err}");
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
                            target: "fibernet::registry",
                            "session {:?} idle past deadline; closing", session.peer_addr()
                        );
                        session.close();
                    },
                    true,
                ));
            }
        }
    }
}

impl ServiceDelegate for RpcRegistry {
    /// Per-session state machine; provider sessions carry their announced
    /// address through the whole session lifetime.
    fn handle_client(self: Arc<Self>, stream: fiber::net::TcpStream) {
        let session = Arc::new(RpcSession::new(stream));
        let mut watchdog = None;
        self.watchdog(&session, &mut watchdog);
        let mut provider: Option<String> = None;

        loop {
            let Some(frame) = session.recv() else {
                if let Some(address) = &provider {
                    log::warn!(
                        target: "fibernet::registry",
                        "provider {address} disconnected; unregistering"
                    );
                    self.handle_unregister(address);
                }
                break;
            };
            self.watchdog(&session, &mut watchdog);

            let response = match frame.message_type {
                MessageType::HeartbeatPacket => Some(Frame::heartbeat()),
                MessageType::RpcProvider => {
                    provider = self.handle_provider(&frame, &session);
                    None
                }
                MessageType::RpcServiceRegister => {
                    Some(self.handle_register(&frame, provider.as_ref()))
                }
                MessageType::RpcServiceDiscover => Some(self.handle_discover(&frame)),
                MessageType::RpcSubscribeRequest => self.handle_subscribe(&frame, &session),
                MessageType::RpcPublishResponse => None,
                other => {
                    log::debug!(target: "fibernet::registry", "ignoring {other} frame");
                    None
                }
            };
            if let Some(response) = response {
                if session.send(&response).is_err() {
                    // The send failure path re-enters the loop; recv will
                    // observe the closure and run the unregister branch.
                    continue;
                }
            }
        }

        if let Some(watchdog) = watchdog {
            watchdog.cancel();
        }
        session.close();
    }
}
