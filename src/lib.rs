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

//! Coroutine-based network service framework with an RPC service mesh.
//!
//! The crate layers an RPC fabric over the [`fiber`] runtime: a length-
//! delimited wire protocol with varint/ZigZag codecs ([`protocol`],
//! [`buffer`], [`serialize`]), framed [`session`]s over fiber-suspending
//! TCP, and four RPC components — [`RpcClient`], [`RpcServer`],
//! [`RpcRegistry`] and the registry-aware [`ConnectionPool`] — supporting
//! unary, async and callback calls, publish/subscribe, heartbeating and
//! automatic service discovery with client-side load balancing.

#[macro_use]
extern crate amplify;

pub mod buffer;
pub mod client;
mod guarded;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod rpc;
pub mod serialize;
pub mod server;
pub mod session;
pub mod tcp;

pub use client::RpcClient;
pub use pool::ConnectionPool;
pub use protocol::{Frame, MessageType};
pub use registry::RpcRegistry;
pub use route::Strategy;
pub use rpc::{RpcCode, RpcResult, SERVICE_SUBSCRIBE};
pub use serialize::{Decode, Encode, Serializer};
pub use server::RpcServer;
pub use session::RpcSession;
pub use tcp::{ServiceDelegate, TcpServer};
