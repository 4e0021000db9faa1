// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Counting and ordering primitives for in-flight tasks.
//!
//! These are the small waiting blocks the executor leans on: a counting
//! semaphore that can wait on an arbitrary count, a strict-priority variant,
//! and a sticky one-shot notification.

use std::sync::{Condvar, Mutex, MutexGuard};

fn lock_or_recover<T>(mu: &Mutex<T>) -> MutexGuard<'_, T> {
    match mu.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Semaphore that can wait on a count.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u64>,
    cv: Condvar,
}

impl Semaphore {
    /// Initialized as locked when `init` is zero.
    pub fn new(init: u64) -> Self {
        Self {
            count: Mutex::new(init),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self, c: u64) {
        let mut count = lock_or_recover(&self.count);
        *count += c;
        self.cv.notify_all();
    }

    /// Blocks until at least `c` is available, then takes it.
    pub fn wait(&self, c: u64) {
        let mut count = lock_or_recover(&self.count);
        while *count < c {
            count = match self.cv.wait(count) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *count -= c;
    }

    /// Whether a `wait(c)` right now would block.
    pub fn may_block(&self, c: u64) -> bool {
        *lock_or_recover(&self.count) < c
    }

    pub fn count(&self) -> u64 {
        *lock_or_recover(&self.count)
    }
}

#[derive(Debug)]
struct PriorityState {
    count: u64,
    pending: Vec<u64>,
}

/// Semaphore with strict priority: as long as a higher-priority waiter has
/// pending demand, lower-priority requests wait even when the count would
/// suffice. Priority 0 is the highest.
#[derive(Debug)]
pub struct PrioritySemaphore {
    state: Mutex<PriorityState>,
    cv: Condvar,
    levels: usize,
}

impl PrioritySemaphore {
    pub fn new(levels: usize, init: u64) -> Self {
        assert!(levels > 0, "at least one priority level is required");
        Self {
            state: Mutex::new(PriorityState {
                count: init,
                pending: vec![0; levels],
            }),
            cv: Condvar::new(),
            levels,
        }
    }

    pub fn post(&self, c: u64) {
        let mut state = lock_or_recover(&self.state);
        state.count += c;
        self.cv.notify_all();
    }

    pub fn wait(&self, c: u64, priority: usize) {
        assert!(priority < self.levels);
        let mut state = lock_or_recover(&self.state);
        if Self::can_take(&state, c, priority) {
            state.count -= c;
            return;
        }
        state.pending[priority] += 1;
        while !Self::can_take(&state, c, priority) {
            state = match self.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.pending[priority] -= 1;
        state.count -= c;
        // Our departure may unblock a lower-priority waiter.
        self.cv.notify_all();
    }

    pub fn try_wait(&self, c: u64, priority: usize) -> bool {
        assert!(priority < self.levels);
        let mut state = lock_or_recover(&self.state);
        if Self::can_take(&state, c, priority) {
            state.count -= c;
            return true;
        }
        false
    }

    // A waiter at `priority` may proceed only when no higher level has
    // pending demand. The waiter's own pending mark is still set when waking
    // from the condvar, so only strictly-higher levels are checked.
    fn can_take(state: &PriorityState, c: u64, priority: usize) -> bool {
        if state.pending[..priority].iter().any(|p| *p > 0) {
            return false;
        }
        state.count >= c
    }
}

/// Notification that is sticky: once set, all current and future waiters are
/// released.
#[derive(Debug, Default)]
pub struct Notification {
    notified: Mutex<bool>,
    cv: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut notified = lock_or_recover(&self.notified);
        *notified = true;
        self.cv.notify_all();
    }

    pub fn notified(&self) -> bool {
        *lock_or_recover(&self.notified)
    }

    pub fn wait(&self) {
        let mut notified = lock_or_recover(&self.notified);
        while !*notified {
            notified = match self.cv.wait(notified) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}
