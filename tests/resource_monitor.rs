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

//! Reservation ledger properties under contention.

use std::sync::Arc;
use std::thread;

use mind_exec::device::DeviceSpec;
use mind_exec::resources::monitor::ResourceMonitor;
use mind_exec::resources::{ResourceMap, ResourceTag};

fn gpu_mem() -> ResourceTag {
    ResourceTag::memory(DeviceSpec::gpu(0))
}

#[test]
fn concurrent_reservers_never_oversubscribe() {
    let monitor = Arc::new(ResourceMonitor::new(ResourceMap::single(gpu_mem(), 100.0)));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let monitor = Arc::clone(&monitor);
        handles.push(thread::spawn(move || {
            monitor.reserve(&ResourceMap::single(gpu_mem(), 30.0)).ok()
        }));
    }

    let tickets: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().expect("reserver thread"))
        .collect();

    // 100 / 30 -> exactly three reservations fit, ties broken by arrival.
    assert_eq!(tickets.len(), 3);
    assert_eq!(monitor.available(&gpu_mem()), 10.0);

    for t in tickets {
        monitor.free(t);
    }
    assert_eq!(monitor.available(&gpu_mem()), 100.0);
}

#[test]
fn multi_tag_reservation_is_all_or_nothing() {
    let cpu_mem = ResourceTag::memory(DeviceSpec::cpu(0));
    let mut capacity = ResourceMap::single(gpu_mem(), 100.0);
    capacity.set(cpu_mem, 10.0);
    let monitor = ResourceMonitor::new(capacity);

    // GPU part fits, CPU part does not: nothing is deducted.
    let mut request = ResourceMap::single(gpu_mem(), 50.0);
    request.set(cpu_mem, 20.0);
    assert!(monitor.reserve(&request).is_err());
    assert_eq!(monitor.available(&gpu_mem()), 100.0);
    assert_eq!(monitor.available(&cpu_mem), 10.0);
}

#[test]
fn charge_refund_cycle_keeps_books_balanced() {
    let monitor = ResourceMonitor::new(ResourceMap::single(gpu_mem(), 100.0));
    let ticket = monitor
        .reserve(&ResourceMap::single(gpu_mem(), 40.0))
        .unwrap();

    monitor.charge(ticket, gpu_mem(), 30.0).unwrap();
    assert_eq!(monitor.charged(ticket).unwrap().get(&gpu_mem()), 30.0);
    monitor.refund(ticket, gpu_mem(), 30.0);
    assert_eq!(monitor.charged(ticket).unwrap().get(&gpu_mem()), 0.0);

    // Scratch fully refunded: the whole reservation returns on free.
    monitor.free(ticket);
    assert_eq!(monitor.available(&gpu_mem()), 100.0);
}

#[test]
fn double_free_after_single_reserve_is_noop() {
    let monitor = ResourceMonitor::new(ResourceMap::single(gpu_mem(), 100.0));
    let ticket = monitor
        .reserve(&ResourceMap::single(gpu_mem(), 25.0))
        .unwrap();
    monitor.free(ticket);
    let after_first = monitor.available(&gpu_mem());
    monitor.free(ticket);
    assert_eq!(monitor.available(&gpu_mem()), after_first);
    // Charging a freed ticket fails cleanly too.
    assert!(monitor.charge(ticket, gpu_mem(), 1.0).is_err());
}

#[test]
fn add_capacity_extends_headroom() {
    let monitor = ResourceMonitor::new(ResourceMap::new());
    assert!(monitor
        .reserve(&ResourceMap::single(gpu_mem(), 1.0))
        .is_err());
    monitor.add_capacity(gpu_mem(), 64.0);
    assert!(monitor.reserve(&ResourceMap::single(gpu_mem(), 1.0)).is_ok());
}
