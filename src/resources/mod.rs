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

//! Typed resource quantities keyed by (kind, device).
//!
//! A `ResourceMap` is the currency of the engine: estimates, reservations and
//! session usage are all point-wise maps from `ResourceTag` to a non-negative
//! quantity. The map is deliberately small (a handful of tags per task) and
//! ordered, so iteration and debug output stay deterministic.

pub mod monitor;

use std::collections::BTreeMap;
use std::fmt;

use crate::device::DeviceSpec;

/// Kind of resource accounted for. `Memory` is the load-bearing one; the
/// interface admits more kinds without changing any signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Memory,
    Compute,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => write!(f, "MEMORY"),
            ResourceKind::Compute => write!(f, "COMPUTE"),
        }
    }
}

/// Identifies one scalar quantity: `(MEMORY, CPU:0)` and `(MEMORY, GPU:0)`
/// are distinct tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceTag {
    pub kind: ResourceKind,
    pub device: DeviceSpec,
}

impl ResourceTag {
    pub fn new(kind: ResourceKind, device: DeviceSpec) -> Self {
        Self { kind, device }
    }

    pub fn memory(device: DeviceSpec) -> Self {
        Self::new(ResourceKind::Memory, device)
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.device)
    }
}

/// Finite mapping `ResourceTag -> quantity` with point-wise operations.
///
/// Entries that reach zero are pruned, so `is_empty` means "no demand" and
/// two maps compare equal regardless of explicit zeros.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceMap {
    entries: BTreeMap<ResourceTag, f64>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-entry map, handy for building requests.
    pub fn single(tag: ResourceTag, amount: f64) -> Self {
        let mut m = Self::new();
        m.set(tag, amount);
        m
    }

    pub fn get(&self, tag: &ResourceTag) -> f64 {
        self.entries.get(tag).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, tag: ResourceTag, amount: f64) {
        if amount <= 0.0 {
            self.entries.remove(&tag);
        } else {
            self.entries.insert(tag, amount);
        }
    }

    pub fn add(&mut self, tag: ResourceTag, delta: f64) {
        let next = self.get(&tag) + delta;
        self.set(tag, next);
    }

    /// Point-wise `self += other`.
    pub fn merge(&mut self, other: &ResourceMap) {
        for (tag, amount) in &other.entries {
            self.add(*tag, *amount);
        }
    }

    /// Point-wise `self *= k`.
    pub fn scale(&mut self, k: f64) {
        let tags: Vec<ResourceTag> = self.entries.keys().copied().collect();
        for tag in tags {
            let scaled = self.get(&tag) * k;
            self.set(tag, scaled);
        }
    }

    /// Point-wise `self <= other`: every entry of `self` fits within the
    /// corresponding entry of `other`.
    pub fn leq(&self, other: &ResourceMap) -> bool {
        self.entries
            .iter()
            .all(|(tag, amount)| *amount <= other.get(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceTag, &f64)> {
        self.entries.iter()
    }
}

impl fmt::Display for ResourceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (tag, amount)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}: {amount}")?;
        }
        write!(f, "}}")
    }
}

/// Observed per-session resource consumption, maintained by the session-level
/// tracker outside this crate. `persistent` covers tensors that outlive a
/// task, `temporary` the scratch peaks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUsage {
    pub temporary: ResourceMap,
    pub persistent: ResourceMap,
}

impl SessionUsage {
    /// Point-wise sum of temporary and persistent usage, the empirical upper
    /// bound consulted on retry.
    pub fn merged(&self) -> ResourceMap {
        let mut m = self.temporary.clone();
        m.merge(&self.persistent);
        m
    }
}

/// Session-level usage lookup, provided by the host server.
pub trait SessionTracker: Send + Sync {
    /// Observed usage for `session`, or `None` if the tracker has no record.
    fn usage(&self, session: &str) -> Option<SessionUsage>;
}
