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

//! Process-wide reservation ledger.
//!
//! Tasks reserve their estimated usage up front and receive a [`Ticket`];
//! per-task device views then charge individual allocations against that
//! ticket. Availability only moves at `reserve`/`free` time; charges expose
//! empirical usage and detect over-draw, they never touch the pool.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::trace;

use crate::device::DeviceSpec;
use crate::error::OpError;
use crate::resources::{ResourceMap, ResourceTag};

/// Opaque identity for a live reservation. Copyable; validity is tracked by
/// the monitor, so a stale ticket simply stops matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket#{}", self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MonitorError {
    /// All-or-nothing reservation failed; the ledger is unchanged.
    #[error("reservation denied for {request}")]
    Denied { request: ResourceMap },
    /// A charge overdrew the ticket's reservation.
    #[error("{ticket} exhausted: charge of {amount} on {tag} exceeds remaining {remaining}")]
    Exhausted {
        ticket: Ticket,
        tag: ResourceTag,
        amount: f64,
        remaining: f64,
    },
    #[error("unknown {0}")]
    UnknownTicket(Ticket),
}

impl From<MonitorError> for OpError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Denied { .. } | MonitorError::Exhausted { .. } => {
                OpError::ResourceExhausted(e.to_string())
            }
            MonitorError::UnknownTicket(_) => OpError::FailedPrecondition(e.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Reservation {
    /// Unspent part of the reservation; charges draw this down.
    remaining: ResourceMap,
    /// Amounts currently charged, reported as empirical usage.
    charged: ResourceMap,
}

#[derive(Debug, Default)]
struct Ledger {
    available: ResourceMap,
    reservations: HashMap<u64, Reservation>,
    next_ticket: u64,
}

/// Process-wide ledger mapping `ResourceTag -> available quantity`.
///
/// All operations are atomic under one mutex; ties between concurrent
/// reservers are broken by lock acquisition order.
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    ledger: Mutex<Ledger>,
}

impl ResourceMonitor {
    pub fn new(capacity: ResourceMap) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                available: capacity,
                ..Ledger::default()
            }),
        }
    }

    /// Adds headroom for `tag`, typically when a device registers.
    pub fn add_capacity(&self, tag: ResourceTag, amount: f64) {
        let mut ledger = self.lock();
        ledger.available.add(tag, amount);
    }

    /// Atomic all-or-nothing reservation: either every tag in `request` has
    /// enough headroom and all are deducted, or nothing changes.
    pub fn reserve(&self, request: &ResourceMap) -> Result<Ticket, MonitorError> {
        let mut ledger = self.lock();
        if !request.leq(&ledger.available) {
            return Err(MonitorError::Denied {
                request: request.clone(),
            });
        }
        for (tag, amount) in request.iter() {
            ledger.available.add(*tag, -amount);
        }
        ledger.next_ticket += 1;
        let ticket = Ticket(ledger.next_ticket);
        ledger.reservations.insert(
            ticket.0,
            Reservation {
                remaining: request.clone(),
                charged: ResourceMap::new(),
            },
        );
        trace!(%ticket, request = %request, "reserved");
        Ok(ticket)
    }

    /// Returns the reservation's remaining balance to the pool and
    /// invalidates the ticket. Idempotent: a second free of the same ticket
    /// is a no-op. Amounts still charged at free time stay deducted; they
    /// belong to allocations that outlive the task.
    pub fn free(&self, ticket: Ticket) {
        let mut ledger = self.lock();
        let Some(res) = ledger.reservations.remove(&ticket.0) else {
            return;
        };
        let remaining = res.remaining;
        ledger.available.merge(&remaining);
        trace!(%ticket, returned = %remaining, "freed");
    }

    /// Draws `amount` of `tag` from the ticket's reservation. Over-draw
    /// leaves the reservation unchanged and reports exhaustion; the caller
    /// converts that into the OOM-retry path.
    pub fn charge(&self, ticket: Ticket, tag: ResourceTag, amount: f64) -> Result<(), MonitorError> {
        let mut ledger = self.lock();
        let res = ledger
            .reservations
            .get_mut(&ticket.0)
            .ok_or(MonitorError::UnknownTicket(ticket))?;
        let remaining = res.remaining.get(&tag);
        if amount > remaining {
            return Err(MonitorError::Exhausted {
                ticket,
                tag,
                amount,
                remaining,
            });
        }
        res.remaining.add(tag, -amount);
        res.charged.add(tag, amount);
        Ok(())
    }

    /// Returns `amount` of `tag` to the ticket's reservation. A refund on a
    /// freed ticket is a no-op (the balance already left with the task).
    pub fn refund(&self, ticket: Ticket, tag: ResourceTag, amount: f64) {
        let mut ledger = self.lock();
        let Some(res) = ledger.reservations.get_mut(&ticket.0) else {
            trace!(%ticket, "refund on freed ticket ignored");
            return;
        };
        let give_back = amount.min(res.charged.get(&tag));
        res.charged.add(tag, -give_back);
        res.remaining.add(tag, give_back);
    }

    /// Current headroom for `tag`.
    pub fn available(&self, tag: &ResourceTag) -> f64 {
        self.lock().available.get(tag)
    }

    /// Amounts currently charged against `ticket`, or `None` once freed.
    pub fn charged(&self, ticket: Ticket) -> Option<ResourceMap> {
        self.lock()
            .reservations
            .get(&ticket.0)
            .map(|r| r.charged.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Binds a task to its reservation on a concrete device. Owned by the task
/// between `prepare` and finish; the per-task device view holds a shared
/// handle to route allocations through the ticket.
#[derive(Debug)]
pub struct ResourceContext {
    spec: DeviceSpec,
    ticket: Ticket,
    monitor: Arc<ResourceMonitor>,
}

impl ResourceContext {
    pub fn new(spec: DeviceSpec, ticket: Ticket, monitor: Arc<ResourceMonitor>) -> Self {
        Self {
            spec,
            ticket,
            monitor,
        }
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Charges `amount` of `tag` against the reservation.
    pub fn charge(&self, tag: ResourceTag, amount: f64) -> Result<(), MonitorError> {
        self.monitor.charge(self.ticket, tag, amount)
    }

    /// Charges device memory, the common case for kernel allocations.
    pub fn charge_memory(&self, bytes: usize) -> Result<(), MonitorError> {
        self.charge(ResourceTag::memory(self.spec), bytes as f64)
    }

    pub fn refund(&self, tag: ResourceTag, amount: f64) {
        self.monitor.refund(self.ticket, tag, amount);
    }

    pub fn refund_memory(&self, bytes: usize) {
        self.refund(ResourceTag::memory(self.spec), bytes as f64);
    }

    /// Frees the underlying reservation. Safe to call more than once.
    pub fn release(&self) {
        self.monitor.free(self.ticket);
    }
}

impl fmt::Display for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceContext({} on {})", self.ticket, self.spec)
    }
}
