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

//! Client-side route selection over discovered provider addresses.

use std::hash::{DefaultHasher, Hash, Hasher};

use rand::Rng;

/// Selector tag for the route strategy of a connection pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
#[display(lowercase)]
pub enum Strategy {
    /// Uniformly random provider per call.
    #[default]
    Random,
    /// Round-robin over the address list.
    Polling,
    /// Stable choice keyed by the caller's address: the same caller lands
    /// on the same provider for a given address list.
    HashIp,
}

/// Policy choosing one address from a non-empty list.
pub trait RouteStrategy: Send {
    fn select<'a>(&mut self, list: &'a [String]) -> &'a String;
}

struct Random;

impl RouteStrategy for Random {
    fn select<'a>(&mut self, list: &'a [String]) -> &'a String {
        assert!(!list.is_empty(), "route selection over an empty list");
        &list[rand::thread_rng().gen_range(0..list.len())]
    }
}

struct Polling {
    index: usize,
}

impl RouteStrategy for Polling {
    fn select<'a>(&mut self, list: &'a [String]) -> &'a String {
        assert!(!list.is_empty(), "route selection over an empty list");
        if self.index >= list.len() {
            self.index = 0;
        }
        let choice = &list[self.index];
        self.index += 1;
        choice
    }
}

struct HashIp {
    key: String,
}

impl RouteStrategy for HashIp {
    fn select<'a>(&mut self, list: &'a [String]) -> &'a String {
        assert!(!list.is_empty(), "route selection over an empty list");
        let mut hasher = DefaultHasher::new();
        self.key.hash(&mut hasher);
        &list[(hasher.finish() % list.len() as u64) as usize]
    }
}

/// Builds the selector for `strategy`; `hash_key` feeds [`Strategy::HashIp`]
/// (callers pass their own address) and is ignored otherwise.
pub fn select_engine(strategy: Strategy, hash_key: &str) -> Box<dyn RouteStrategy> {
    match strategy {
        Strategy::Random => Box::new(Random),
        Strategy::Polling => Box::new(Polling { index: 0 }),
        Strategy::HashIp => Box::new(HashIp { key: hash_key.to_owned() }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addresses() -> Vec<String> {
        vec![s!("127.0.0.1:50051"), s!("127.0.0.1:50052"), s!("127.0.0.1:50053")]
    }

    #[test]
    fn polling_cycles_in_order() {
        let list = addresses();
        let mut engine = select_engine(Strategy::Polling, "");
        let picks: Vec<&String> = (0..6).map(|_| engine.select(&list)).collect();
        assert_eq!(picks, vec![&list[0], &list[1], &list[2], &list[0], &list[1], &list[2]]);
    }

    #[test]
    fn random_stays_in_bounds() {
        let list = addresses();
        let mut engine = select_engine(Strategy::Random, "");
        for _ in 0..64 {
            assert!(list.contains(engine.select(&list)));
        }
    }

    #[test]
    fn hash_ip_is_stable_per_key() {
        let list = addresses();
        let mut engine = select_engine(Strategy::HashIp, "192.168.1.10");
        let first = engine.select(&list).clone();
        for _ in 0..16 {
            assert_eq!(engine.select(&list), &first);
        }
    }
}
