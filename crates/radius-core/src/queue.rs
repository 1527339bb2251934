//! Bounded priority heap of pending requests, with probabilistic admission
//! control for accounting packets (§4.5).
//!
//! `std::collections::BinaryHeap` needs one static `Ord`, but the comparator
//! is chosen at construction (`default`/`time`/`eap`), so each queued entry
//! carries a copy of the selected comparator and delegates `Ord::cmp` to it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::error;

use crate::config::QueuePriority as Comparator;
use crate::error::CoreError;
use crate::pps::PpsMeter;
use crate::types::{ChildState, MasterState, Request};

fn cmp_default(a: &Request, b: &Request) -> Ordering {
    match b.priority.cmp(&a.priority) {
        Ordering::Equal => b.timestamp.cmp(&a.timestamp),
        other => other,
    }
}

fn cmp_for(comparator: Comparator, a: &Request, b: &Request) -> Ordering {
    match comparator {
        Comparator::Default => cmp_default(a, b),
        Comparator::Time => b.timestamp.cmp(&a.timestamp),
        Comparator::Eap => match a.rounds.cmp(&b.rounds) {
            Ordering::Equal => cmp_default(a, b),
            other => other,
        },
    }
}

struct HeapEntry {
    request: Request,
    comparator: Comparator,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        cmp_for(self.comparator, &self.request, &other.request) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_for(self.comparator, &self.request, &other.request)
    }
}

/// Outcome of [`RequestQueue::insert`].
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Accepted into the heap.
    Queued,
    /// Admission control dropped an accounting packet; the caller should
    /// treat this the same as a successful submission (§4.5).
    Dropped,
    /// The heap is at capacity.
    Rejected,
}

/// A small deterministic PRNG (xorshift64*), used only for the admission
/// control's 10-bit draw — swappable for a fixed seed in tests that need
/// reproducible drop fractions (§8 scenario 3).
struct Rng(u64);

impl Rng {
    fn next_u10(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x & 0x3ff) as u32
    }
}

pub struct RequestQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    comparator: Comparator,
    max_queue_size: usize,
    auto_limit_acct: bool,
    input_pps: PpsMeter,
    output_pps: PpsMeter,
    rng: Mutex<Rng>,
    total_blocked: AtomicU64,
    last_blocked_log: Mutex<Instant>,
}

impl RequestQueue {
    pub fn new(comparator: Comparator, max_queue_size: usize, auto_limit_acct: bool) -> Self {
        Self::with_seed(comparator, max_queue_size, auto_limit_acct, 0x9E3779B97F4A7C15)
    }

    pub fn with_seed(comparator: Comparator, max_queue_size: usize, auto_limit_acct: bool, seed: u64) -> Self {
        RequestQueue {
            heap: Mutex::new(BinaryHeap::new()),
            comparator,
            max_queue_size,
            auto_limit_acct,
            input_pps: PpsMeter::new(),
            output_pps: PpsMeter::new(),
            rng: Mutex::new(Rng(seed | 1)),
            total_blocked: AtomicU64::new(0),
            last_blocked_log: Mutex::new(Instant::now() - Duration::from_secs(2)),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_blocked(&self) -> u64 {
        self.total_blocked.load(AtomicOrdering::Relaxed)
    }

    /// `insert(r)` (§4.5): capacity check, then accounting admission control.
    pub fn insert(&self, mut request: Request) -> InsertOutcome {
        let now = request.timestamp;
        self.input_pps.record(now);

        let mut heap = self.heap.lock().expect("queue poisoned");
        if heap.len() + 1 >= self.max_queue_size {
            return InsertOutcome::Rejected;
        }

        if self.auto_limit_acct && request.packet_code.is_accounting() && self.should_drop(heap.len(), now) {
            request.finish(crate::types::Rcode::Ok);
            return InsertOutcome::Dropped;
        }

        request.child_state = ChildState::Queued;
        heap.push(HeapEntry { request, comparator: self.comparator });
        InsertOutcome::Queued
    }

    /// Linear drop probability rising from 0 at half-full to 1 at full (§4.5).
    fn should_drop(&self, current_len: usize, now: Instant) -> bool {
        if self.input_pps.rate(now) <= self.output_pps.rate(now) {
            return false;
        }
        let half = self.max_queue_size / 2;
        if current_len < half {
            return false;
        }
        let r10 = self.rng.lock().expect("rng poisoned").next_u10();
        let keep = half + (half * r10 as usize) / 1024;
        current_len > keep
    }

    /// `pop() → r` (§4.5): drops cancelled requests and retries; tracks the
    /// blocked-request diagnostic.
    pub fn pop(&self, now: Instant) -> Option<Request> {
        loop {
            let mut heap = self.heap.lock().expect("queue poisoned");
            let entry = heap.pop()?;
            drop(heap);
            self.output_pps.record(now);

            let mut request = entry.request;
            if request.master_state == MasterState::StopProcessing {
                request.finish(crate::types::Rcode::Ok);
                continue;
            }

            if now.saturating_duration_since(request.timestamp) > Duration::from_secs(5) {
                let total = self.total_blocked.fetch_add(1, AtomicOrdering::Relaxed) + 1;
                let mut last_log = self.last_blocked_log.lock().expect("queue poisoned");
                if now.saturating_duration_since(*last_log) >= Duration::from_secs(1) {
                    *last_log = now;
                    error!(
                        total_blocked = total,
                        age_ms = now.saturating_duration_since(request.timestamp).as_millis() as u64,
                        "request blocked in queue"
                    );
                }
            }
            return Some(request);
        }
    }
}
