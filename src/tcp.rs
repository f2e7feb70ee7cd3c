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

//! Multi-address TCP accept server.
//!
//! Binds a set of listening addresses (all-or-nothing), runs one accept
//! fiber per listener on the accept reactor, and dispatches every accepted
//! connection to the delegate on the I/O reactor. The three reactors —
//! accept, I/O and worker — may be one and the same; services that want to
//! segregate accept traffic from request processing pass distinct ones.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use fiber::net::TcpListener;
use fiber::Reactor;

/// Connection handler plugged into a [`TcpServer`].
pub trait ServiceDelegate: Send + Sync + 'static {
    /// Runs the whole lifetime of one accepted connection; executed as a
    /// fiber on the I/O reactor.
    fn handle_client(self: Arc<Self>, stream: fiber::net::TcpStream);
}

/// Errors of server binding.
#[derive(Debug, Display, Error)]
#[display(doc_comments)]
pub enum BindError {
    /// binding failed for addresses {failed:?}.
    Addresses {
        failed: Vec<SocketAddr>,
    },

    /// no listening address given.
    Empty,
}

/// Accept-loop server base shared by the RPC server and the registry.
pub struct TcpServer {
    name: String,
    accept_reactor: Arc<Reactor>,
    io_reactor: Arc<Reactor>,
    worker_reactor: Arc<Reactor>,
    listeners: StdMutex<Vec<Arc<TcpListener>>>,
    stopped: AtomicBool,
}

impl TcpServer {
    /// A server whose accept, I/O and worker pools are all `reactor`.
    pub fn with_reactor(name: &str, reactor: Arc<Reactor>) -> TcpServer {
        TcpServer::new(name, reactor.clone(), reactor.clone(), reactor)
    }

    pub fn new(
        name: &str,
        accept_reactor: Arc<Reactor>,
        io_reactor: Arc<Reactor>,
        worker_reactor: Arc<Reactor>,
    ) -> TcpServer {
        TcpServer {
            name: name.to_owned(),
            accept_reactor,
            io_reactor,
            worker_reactor,
            listeners: StdMutex::new(empty!()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn worker_reactor(&self) -> &Arc<Reactor> { &self.worker_reactor }

    /// Binds every address, collecting failures; either all listeners come
    /// up or none do.
    pub fn bind(&self, addrs: &[SocketAddr]) -> Result<(), BindError> {
        if addrs.is_empty() {
            return Err(BindError::Empty);
        }
        let mut bound = Vec::new();
        let mut failed = Vec::new();
        for &addr in addrs {
            match TcpListener::bind(addr) {
                Ok(listener) => bound.push(Arc::new(listener)),
                Err(err) => {
                    log::error!(
                        target: "fibernet::server",
                        "{} cannot bind {addr}: {err}", self.name
                    );
                    failed.push(addr);
                }
            }
        }
        if !failed.is_empty() {
            return Err(BindError::Addresses { failed });
        }
        for listener in &bound {
            log::info!(
                target: "fibernet::server",
                "{} bound {}", self.name, listener.local_addr()
            );
        }
        self.listeners.lock().expect("listener lock").extend(bound);
        Ok(())
    }

    /// Bound listening addresses, in bind order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.lock().expect("listener lock").iter().map(|l| l.local_addr()).collect()
    }

    /// Starts one accept fiber per listener, handing every accepted
    /// connection to `delegate`.
    pub fn start<D: ServiceDelegate>(&self, delegate: Arc<D>) -> io::Result<()> {
        let listeners = self.listeners.lock().expect("listener lock").clone();
        if listeners.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "server is not bound"));
        }
        for listener in listeners {
            let name = self.name.clone();
            let delegate = delegate.clone();
            let io_reactor = self.io_reactor.clone();
            self.accept_reactor.schedule(move || {
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::debug!(
                                target: "fibernet::server",
                                "{name} accepted connection from {peer}"
                            );
                            let delegate = delegate.clone();
                            io_reactor.schedule(move || delegate.handle_client(stream));
                        }
                        Err(err) => {
                            log::debug!(
                                target: "fibernet::server",
                                "{name} accept loop finished: {err}"
                            );
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    /// Closes every listener; pending accepts wake and the accept fibers
    /// finish.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock().expect("listener lock"));
        for listener in listeners {
            let closer = listener.clone();
            // Listener events live on the accept reactor; close from there.
            self.accept_reactor.schedule(move || closer.close());
        }
        log::info!(target: "fibernet::server", "{} stopped", self.name);
    }
}
