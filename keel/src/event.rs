// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Scheduled events and the named watch registry.
//!
//! Events are (procedure, absolute deadline) pairs keyed by a process-wide
//! unique 64-bit id (never zero, never reused). Due events fire in
//! ascending deadline order with FIFO tie-break. A regular event runs on a
//! freshly spawned fiber and may suspend; a fast event runs inline on the
//! main context and must not.
//!
//! Watches bind a name to subscriber callbacks: [`Runtime::signal`]
//! delivers one fiber event per subscriber, [`Runtime::signal_sync`] calls
//! them inline.

use bitflags::bitflags;
use core::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::rerror;
use crate::runtime::Runtime;
use crate::task::LocalFuture;
use crate::time::{Ticks, ticks};

/// Event identifier: unique for the life of the process, never zero.
pub type EventId = u64;

/// Watch subscription identifier, used to unsubscribe.
pub type WatchId = u64;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct EventFlags: u32 {
        /// Run inline on the main context at fire time. The procedure must
        /// not suspend.
        const FAST = 1 << 0;
    }
}

pub(crate) enum EventProc {
    Fast(Box<dyn FnOnce()>),
    Fiber(Box<dyn FnOnce() -> LocalFuture>),
}

/// Deadline-ordered queue with lazy deletion: cancelled ids stay in the
/// heap and are skipped when they surface. FIFO tie-break falls out of the
/// monotonic id in the heap key.
pub(crate) struct EventQueue {
    heap: BinaryHeap<Reverse<(Ticks, EventId)>>,
    entries: HashMap<EventId, EventProc>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: EventId, deadline: Ticks, proc: EventProc) {
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, proc);
    }

    fn remove(&mut self, id: EventId) -> Option<EventProc> {
        self.entries.remove(&id)
    }

    fn contains(&self, id: EventId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove and return the next event due at `now`.
    fn pop_due(&mut self, now: Ticks) -> Option<(EventId, EventProc)> {
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(entry) = self.entries.remove(&id) {
                return Some((id, entry));
            }
        }
        None
    }

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

pub(crate) struct WatchEntry {
    pub(crate) id: WatchId,
    pub(crate) proc: Rc<dyn Fn(&str, Option<&dyn Any>)>,
}

// === impl Runtime: events ===

impl Runtime {
    /// Schedule `f` to run on a new fiber after `delay` ticks. The
    /// returned procedure future may suspend.
    pub fn start_event<F, Fut>(&self, delay: Ticks, f: F) -> EventId
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let id = self.inner.shared.next_id();
        let proc = EventProc::Fiber(Box::new(move || Box::pin(f()) as LocalFuture));
        self.queue_event(id, delay, proc);
        id
    }

    /// Schedule `f` to run inline on the main context after `delay` ticks.
    /// `f` must not suspend.
    pub fn start_event_fast<F>(&self, delay: Ticks, f: F) -> EventId
    where
        F: FnOnce() + 'static,
    {
        let id = self.inner.shared.next_id();
        self.queue_event(id, delay, EventProc::Fast(Box::new(f)));
        id
    }

    /// Schedule a non-suspending procedure with explicit flags.
    pub fn alloc_event<F>(&self, delay: Ticks, flags: EventFlags, f: F) -> EventId
    where
        F: FnOnce() + 'static,
    {
        if flags.contains(EventFlags::FAST) {
            self.start_event_fast(delay, f)
        } else {
            self.start_event(delay, move || async move { f() })
        }
    }

    fn queue_event(&self, id: EventId, delay: Ticks, proc: EventProc) {
        let deadline = ticks().saturating_add(delay.max(0));
        self.inner
            .core
            .borrow_mut()
            .events
            .insert(id, deadline, proc);
    }

    /// Cancel a pending event.
    ///
    /// # Errors
    ///
    /// [`Error::CantFind`] when the event already fired, was cancelled, or
    /// never existed.
    pub fn stop_event(&self, id: EventId) -> Result<()> {
        match self.inner.core.borrow_mut().events.remove(id) {
            Some(_) => Ok(()),
            None => Err(Error::CantFind),
        }
    }

    /// Fire a pending event immediately, regardless of its deadline.
    ///
    /// # Errors
    ///
    /// [`Error::CantFind`] when the event already fired or is unknown.
    pub fn run_event(&self, id: EventId) -> Result<()> {
        let proc = self.inner.core.borrow_mut().events.remove(id);
        match proc {
            Some(proc) => {
                self.fire_event(id, proc);
                Ok(())
            }
            None => Err(Error::CantFind),
        }
    }

    /// True while the event is still pending.
    #[must_use]
    pub fn lookup_event(&self, id: EventId) -> bool {
        self.inner.core.borrow().events.contains(id)
    }

    /// True when an event is due at the current tick.
    #[must_use]
    pub fn has_due_events(&self) -> bool {
        self.inner
            .core
            .borrow_mut()
            .events
            .next_deadline()
            .is_some_and(|deadline| deadline <= ticks())
    }

    /// Fire everything due, in (deadline, id) order. Returns the absolute
    /// deadline of the next pending event.
    pub(crate) fn run_due_events(&self) -> Option<Ticks> {
        loop {
            let due = self.inner.core.borrow_mut().events.pop_due(ticks());
            match due {
                Some((id, proc)) => self.fire_event(id, proc),
                None => break,
            }
        }
        self.inner.core.borrow_mut().events.next_deadline()
    }

    fn fire_event(&self, id: EventId, proc: EventProc) {
        match proc {
            EventProc::Fast(f) => {
                if catch_unwind(AssertUnwindSafe(f)).is_err() {
                    rerror!("event", "fast event {id} panicked");
                }
            }
            EventProc::Fiber(make) => {
                if let Err(err) = self.spawn_boxed("event", make()) {
                    rerror!("event", "cannot spawn fiber for event {id}: {err}");
                }
            }
        }
    }

    // === watches ===

    /// Subscribe to `name`. The callback receives the signal name and, for
    /// synchronous delivery, its argument.
    pub fn watch<F>(&self, name: &str, f: F) -> WatchId
    where
        F: Fn(&str, Option<&dyn Any>) + 'static,
    {
        let id = self.inner.shared.next_id();
        self.inner
            .core
            .borrow_mut()
            .watches
            .entry(name.to_string())
            .or_default()
            .push(WatchEntry {
                id,
                proc: Rc::new(f),
            });
        id
    }

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// [`Error::CantFind`] when (name, id) does not match a subscription.
    pub fn watch_off(&self, name: &str, id: WatchId) -> Result<()> {
        let mut core = self.inner.core.borrow_mut();
        let entries = core.watches.get_mut(name).ok_or(Error::CantFind)?;
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Err(Error::CantFind);
        }
        if entries.is_empty() {
            core.watches.remove(name);
        }
        Ok(())
    }

    /// Deliver `name` asynchronously: one zero-delay fiber event per
    /// subscriber, in subscription order.
    pub fn signal(&self, name: &str) {
        let subscribers = self.subscribers(name);
        for entry in subscribers {
            let name = name.to_string();
            self.start_event(0, move || async move {
                (entry.proc)(&name, None);
            });
        }
    }

    /// Deliver `name` inline with an argument. Subscribers must not block.
    /// Subscriptions added while firing become visible on the next signal.
    pub fn signal_sync(&self, name: &str, arg: Option<&dyn Any>) {
        for entry in self.subscribers(name) {
            (entry.proc)(name, arg);
        }
    }

    fn subscribers(&self, name: &str) -> Vec<WatchEntry> {
        self.inner
            .core
            .borrow()
            .watches
            .get(name)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| WatchEntry {
                        id: entry.id,
                        proc: entry.proc.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_runtime;
    use crate::time::sleep;
    use std::cell::RefCell;

    // Scenario: events at +50ms, +10ms, +10ms fire as deadline order with
    // FIFO tie-break.
    #[test]
    fn deadline_order_with_fifo_tie_break() {
        with_runtime(|rt| async move {
            let fired = Rc::new(RefCell::new(Vec::new()));
            for (label, delay) in [("e1", 50), ("e2", 10), ("e3", 10)] {
                let fired = fired.clone();
                rt.start_event(delay, move || async move {
                    fired.borrow_mut().push(label);
                });
            }
            sleep(&rt, 120).await;
            assert_eq!(*fired.borrow(), vec!["e2", "e3", "e1"]);
        });
    }

    // Scenario: a cancelled event never fires and is no longer found.
    #[test]
    fn cancel_prevents_firing() {
        with_runtime(|rt| async move {
            let fired = Rc::new(RefCell::new(false));
            let flag = fired.clone();
            let id = rt.start_event(100, move || async move {
                *flag.borrow_mut() = true;
            });
            assert!(rt.lookup_event(id));

            sleep(&rt, 20).await;
            assert_eq!(rt.stop_event(id), Ok(()));
            assert!(!rt.lookup_event(id));

            sleep(&rt, 200).await;
            assert!(!*fired.borrow());
            assert_eq!(rt.stop_event(id), Err(Error::CantFind));
        });
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        with_runtime(|rt| async move {
            let mut seen = std::collections::HashSet::new();
            for _ in 0..100 {
                let id = rt.start_event_fast(1000, || {});
                assert_ne!(id, 0);
                assert!(seen.insert(id));
                rt.stop_event(id).unwrap();
            }
        });
    }

    #[test]
    fn run_event_fires_early() {
        with_runtime(|rt| async move {
            let fired = Rc::new(RefCell::new(false));
            let flag = fired.clone();
            let id = rt.start_event_fast(60_000, move || {
                *flag.borrow_mut() = true;
            });
            rt.run_event(id).unwrap();
            assert!(*fired.borrow());
            assert!(!rt.lookup_event(id));
            assert_eq!(rt.run_event(id), Err(Error::CantFind));
        });
    }

    #[test]
    fn fast_events_run_on_main_context() {
        with_runtime(|rt| async move {
            let seen = Rc::new(RefCell::new(None));
            let slot = seen.clone();
            rt.start_event_fast(0, move || {
                *slot.borrow_mut() = Some(crate::fiber::is_main());
            });
            sleep(&rt, 20).await;
            assert_eq!(*seen.borrow(), Some(true));
        });
    }

    #[test]
    fn event_fiber_panic_does_not_kill_the_loop() {
        with_runtime(|rt| async move {
            rt.start_event(0, || async {
                panic!("scripted failure");
            });
            sleep(&rt, 30).await;
            // Still servicing events after the panic.
            let fired = Rc::new(RefCell::new(false));
            let flag = fired.clone();
            rt.start_event(0, move || async move {
                *flag.borrow_mut() = true;
            });
            sleep(&rt, 30).await;
            assert!(*fired.borrow());
        });
    }

    #[test]
    fn watch_subscribe_signal_unsubscribe() {
        with_runtime(|rt| async move {
            let hits = Rc::new(RefCell::new(Vec::new()));

            let first = {
                let hits = hits.clone();
                rt.watch("ready", move |name, _| {
                    hits.borrow_mut().push(format!("a:{name}"));
                })
            };
            {
                let hits = hits.clone();
                rt.watch("ready", move |name, arg| {
                    let detail = arg
                        .and_then(|arg| arg.downcast_ref::<&str>())
                        .copied()
                        .unwrap_or("-");
                    hits.borrow_mut().push(format!("b:{name}:{detail}"));
                });
            }

            rt.signal_sync("ready", Some(&"go"));
            assert_eq!(
                *hits.borrow(),
                vec!["a:ready".to_string(), "b:ready:go".to_string()]
            );

            hits.borrow_mut().clear();
            rt.signal("ready");
            // Asynchronous delivery: nothing yet.
            assert!(hits.borrow().is_empty());
            sleep(&rt, 20).await;
            assert_eq!(
                *hits.borrow(),
                vec!["a:ready".to_string(), "b:ready:-".to_string()]
            );

            rt.watch_off("ready", first).unwrap();
            assert_eq!(rt.watch_off("ready", first), Err(Error::CantFind));
            hits.borrow_mut().clear();
            rt.signal_sync("ready", None);
            assert_eq!(*hits.borrow(), vec!["b:ready:-".to_string()]);

            rt.watch_off("missing", 1).unwrap_err();
        });
    }
}
