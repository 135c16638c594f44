// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Deadline heap driven by the service loop.
//!
//! Suspension points with deadlines ([`super::Sleep`], `wait_for_io`, gate
//! timeouts) register here. Cancelled entries stay in the heap and are
//! skipped lazily when they surface.

use crate::time::Ticks;
use core::task::Waker;
use mio::Token;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// What to do when a deadline fires.
pub(crate) enum TimerKind {
    /// Wake a suspended task; it observes the passed deadline itself.
    Wake(Waker),
    /// A wait record armed with a handler timed out; the loop dispatches
    /// the handler with the timeout mask.
    WaitDeadline(Token),
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<(Ticks, u64)>>,
    entries: HashMap<u64, TimerKind>,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    /// Register `kind` to fire at `deadline`. The id must be fresh.
    pub(crate) fn register(&mut self, id: u64, deadline: Ticks, kind: TimerKind) {
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, kind);
    }

    /// Replace the waker of a registered entry (futures re-arm on every
    /// poll).
    pub(crate) fn reset_waker(&mut self, id: u64, waker: Waker) {
        if let Some(entry) = self.entries.get_mut(&id) {
            *entry = TimerKind::Wake(waker);
        }
    }

    pub(crate) fn cancel(&mut self, id: u64) {
        self.entries.remove(&id);
    }

    /// Remove and return everything due at `now`.
    pub(crate) fn take_due(&mut self, now: Ticks) -> Vec<TimerKind> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.entries.remove(&id) {
                due.push(kind);
            }
        }
        due
    }

    /// The next live deadline, skipping cancelled heap residue.
    pub(crate) fn next_deadline(&mut self) -> Option<Ticks> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
    }
}
