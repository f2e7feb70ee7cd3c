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

//! State cells guarded by a fiber mutex.

use std::cell::UnsafeCell;

use fiber::sync::Mutex;

/// A value protected by a fiber-aware [`Mutex`]. Access happens through
/// [`Self::with`], which may park the calling fiber; the closure must not
/// re-enter the same cell.
pub(crate) struct Guarded<T> {
    lock: Mutex,
    cell: UnsafeCell<T>,
}

// The cell is only dereferenced while `lock` is held.
unsafe impl<T: Send> Send for Guarded<T> {}
unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Guarded<T> {
        Guarded { lock: Mutex::new(), cell: UnsafeCell::new(value) }
    }

    pub fn with<R>(&self, body: impl FnOnce(&mut T) -> R) -> R {
        let guard = self.lock.lock();
        let result = body(unsafe { &mut *self.cell.get() });
        drop(guard);
        result
    }
}
