// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers: cooperatively scheduled units of work.
//!
//! A fiber is a future polled by the runtime's single-threaded scheduler.
//! It suspends only at explicit points (`suspend`, `sleep`, socket I/O,
//! `wait_for_io`, gate entry, `spawn_thread`) and never runs in parallel
//! with another fiber. [`suspend`] parks the calling fiber and returns the
//! value a later [`Fiber::resume`] supplies; `resume` is safe to call from
//! foreign OS threads.
//!
//! [`FiberGate`] is the cooperative critical section: a boolean gate that
//! suspends contending fibers instead of spinning, with deadline and
//! try-only entry.

use crate::error::{Error, Result};
use crate::runtime::{Runtime, Shared};
use crate::sync::oneshot;
use crate::time::timer::TimerKind;
use crate::time::{Ticks, ticks};
use core::any::Any;
use core::cell::RefCell;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Values passed through suspend/resume are type-erased; the receiving
/// side downcasts to what it expects.
pub type ResumeValue = Box<dyn Any + Send>;

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Arc<FiberState>>> = const { RefCell::new(None) };
}

pub(crate) struct FiberState {
    id: u64,
    name: Box<str>,
    shared: Arc<Shared>,
    slot: Mutex<ResumeSlot>,
    yielded: Mutex<Option<ResumeValue>>,
    done: AtomicBool,
    join: Mutex<Option<oneshot::Receiver<()>>>,
}

struct ResumeSlot {
    value: Option<ResumeValue>,
    waker: Option<Waker>,
}

impl FiberState {
    pub(crate) fn new(
        id: u64,
        name: &str,
        shared: Arc<Shared>,
        join: oneshot::Receiver<()>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            shared,
            slot: Mutex::new(ResumeSlot {
                value: None,
                waker: None,
            }),
            yielded: Mutex::new(None),
            done: AtomicBool::new(false),
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn finish(&self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Cloneable, thread-safe handle to a spawned fiber.
#[derive(Clone)]
pub struct Fiber {
    state: Arc<FiberState>,
}

impl Fiber {
    pub(crate) fn from_state(state: Arc<FiberState>) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.state.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// True once the fiber's function has returned (or panicked).
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    /// Deliver `value` to the fiber's pending (or next) [`suspend`].
    /// Thread-safe: from a foreign thread the wake is funnelled through the
    /// scheduler's ingress waker.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when the fiber has finished; [`Error::Busy`]
    /// when a prior resume has not been consumed yet (a fiber resumes at
    /// most once per suspend).
    pub fn resume<T: Any + Send>(&self, value: T) -> Result<()> {
        if self.is_done() {
            return Err(Error::BadState);
        }
        let waker = {
            let mut slot = self.state.slot.lock().expect("fiber slot poisoned");
            if slot.value.is_some() {
                return Err(Error::Busy);
            }
            slot.value = Some(Box::new(value));
            slot.waker.take()
        };
        match waker {
            Some(waker) => waker.wake(),
            // Not parked in suspend yet: schedule the fiber so the value is
            // picked up at its next suspension point.
            None => self.state.shared.schedule(self.state.id),
        }
        Ok(())
    }

    /// The value most recently passed to [`suspend`] by this fiber.
    #[must_use]
    pub fn take_yielded(&self) -> Option<ResumeValue> {
        self.state
            .yielded
            .lock()
            .expect("fiber yield slot poisoned")
            .take()
    }

    /// Wait for the fiber to complete.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when `join` was already called;
    /// [`Error::Aborted`] when the fiber panicked.
    pub async fn join(&self) -> Result<()> {
        let rx = {
            self.state
                .join
                .lock()
                .expect("fiber join poisoned")
                .take()
                .ok_or(Error::BadState)?
        };
        rx.await.map_err(|_| Error::Aborted)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("done", &self.is_done())
            .finish()
    }
}

/// The fiber currently executing, if any.
#[must_use]
pub fn current_fiber() -> Option<Fiber> {
    CURRENT_FIBER.with_borrow(|current| current.clone().map(Fiber::from_state))
}

/// True on the main (scheduler) context: inside fast events, synchronous
/// signal delivery and the service loop itself. False inside any fiber.
#[must_use]
pub fn is_main() -> bool {
    CURRENT_FIBER.with_borrow(Option::is_none)
}

/// Park the calling fiber, publishing `yielded` for its handle, until a
/// [`Fiber::resume`] supplies a value.
///
/// # Errors
///
/// [`Error::BadState`] when called from the main context.
pub async fn suspend<Y: Any + Send>(yielded: Y) -> Result<ResumeValue> {
    let state =
        CURRENT_FIBER.with_borrow(|current| current.clone()).ok_or(Error::BadState)?;
    *state.yielded.lock().expect("fiber yield slot poisoned") = Some(Box::new(yielded));
    Ok(Suspend { state }.await)
}

struct Suspend {
    state: Arc<FiberState>,
}

impl Future for Suspend {
    type Output = ResumeValue;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ResumeValue> {
        let mut slot = self.state.slot.lock().expect("fiber slot poisoned");
        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Install `fiber` as the current fiber for the duration of one poll.
pub(crate) fn enter_scope(fiber: Option<Arc<FiberState>>) -> FiberScope {
    let prev = CURRENT_FIBER.with_borrow_mut(|current| core::mem::replace(current, fiber));
    FiberScope { prev }
}

pub(crate) struct FiberScope {
    prev: Option<Arc<FiberState>>,
}

impl Drop for FiberScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_FIBER.with_borrow_mut(|current| *current = prev);
    }
}

// === FiberGate ===

/// Cooperative critical section across suspension points.
///
/// Entry returns an RAII guard; while one fiber holds it, other fibers
/// suspend in [`FiberGate::enter`]. Deadline `0` waits forever; a negative
/// deadline never waits.
#[derive(Clone)]
pub struct FiberGate {
    rt: Runtime,
    inner: Rc<RefCell<GateState>>,
}

struct GateState {
    locked: bool,
    waiters: VecDeque<(u64, Waker)>,
}

impl FiberGate {
    #[must_use]
    pub fn new(rt: &Runtime) -> Self {
        Self {
            rt: rt.clone(),
            inner: Rc::new(RefCell::new(GateState {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Enter without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] when another fiber holds the gate.
    pub fn try_enter(&self) -> Result<GateGuard> {
        let mut state = self.inner.borrow_mut();
        if state.locked {
            return Err(Error::WouldBlock);
        }
        state.locked = true;
        Ok(GateGuard { gate: self.clone() })
    }

    /// Enter, suspending until the gate is free. `deadline` is absolute;
    /// `0` waits forever, negative does not wait.
    ///
    /// # Errors
    ///
    /// [`Error::WouldBlock`] for a failed no-wait entry, [`Error::Timeout`]
    /// when the deadline passes first.
    pub async fn enter(&self, deadline: Ticks) -> Result<GateGuard> {
        if deadline < 0 {
            return self.try_enter();
        }
        Enter {
            gate: self.clone(),
            deadline,
            key: None,
            timer: None,
        }
        .await
    }

    fn unpark_next(&self) {
        let waker = self
            .inner
            .borrow()
            .waiters
            .front()
            .map(|(_, waker)| waker.clone());
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn forget_waiter(&self, key: Option<u64>) {
        if let Some(key) = key {
            let mut state = self.inner.borrow_mut();
            state.waiters.retain(|(entry, _)| *entry != key);
        }
    }
}

impl fmt::Debug for FiberGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberGate")
            .field("locked", &self.inner.borrow().locked)
            .field("waiters", &self.inner.borrow().waiters.len())
            .finish()
    }
}

/// Holds the gate; dropping it leaves the critical section and wakes the
/// next waiter.
pub struct GateGuard {
    gate: FiberGate,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.gate.inner.borrow_mut().locked = false;
        self.gate.unpark_next();
    }
}

impl fmt::Debug for GateGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("GateGuard")
    }
}

struct Enter {
    gate: FiberGate,
    deadline: Ticks,
    key: Option<u64>,
    timer: Option<u64>,
}

impl Future for Enter {
    type Output = Result<GateGuard>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        {
            let mut state = me.gate.inner.borrow_mut();
            if !state.locked {
                state.locked = true;
                drop(state);
                me.cleanup();
                return Poll::Ready(Ok(GateGuard {
                    gate: me.gate.clone(),
                }));
            }
        }
        if me.deadline > 0 && ticks() >= me.deadline {
            me.cleanup();
            return Poll::Ready(Err(Error::Timeout));
        }
        {
            let mut state = me.gate.inner.borrow_mut();
            match me.key {
                Some(key) => {
                    for (entry, waker) in &mut state.waiters {
                        if *entry == key {
                            *waker = cx.waker().clone();
                        }
                    }
                }
                None => {
                    let key = me.gate.rt.inner.shared.next_id();
                    state.waiters.push_back((key, cx.waker().clone()));
                    me.key = Some(key);
                }
            }
        }
        if me.deadline > 0 {
            let mut core = me.gate.rt.inner.core.borrow_mut();
            match me.timer {
                Some(id) => core.timers.reset_waker(id, cx.waker().clone()),
                None => {
                    let id = me.gate.rt.inner.shared.next_id();
                    core.timers
                        .register(id, me.deadline, TimerKind::Wake(cx.waker().clone()));
                    me.timer = Some(id);
                }
            }
        }
        Poll::Pending
    }
}

impl Enter {
    fn cleanup(&mut self) {
        self.gate.forget_waiter(self.key.take());
        if let Some(id) = self.timer.take() {
            self.gate.rt.inner.core.borrow_mut().timers.cancel(id);
        }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        self.cleanup();
        // A cancelled waiter may have swallowed the gate's wakeup; pass it
        // on so the remaining waiters are not stranded.
        if !self.gate.inner.borrow().locked {
            self.gate.unpark_next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_runtime;
    use crate::time::sleep;

    #[test]
    fn main_context_identification() {
        with_runtime(|rt| async move {
            rt.start_event_fast(0, || {
                assert!(is_main());
                assert!(current_fiber().is_none());
            });
            assert!(!is_main());
            assert!(current_fiber().is_some());
            sleep(&rt, 10).await;
        });
    }

    #[test]
    fn gate_excludes_across_suspension_points() {
        with_runtime(|rt| async move {
            let gate = FiberGate::new(&rt);
            let log = Rc::new(RefCell::new(Vec::new()));

            let mut workers = Vec::new();
            for worker in 0..3 {
                let gate = gate.clone();
                let log = log.clone();
                let rt2 = rt.clone();
                let fiber = rt
                    .spawn_fiber("worker", async move {
                        let guard = gate.enter(0).await.unwrap();
                        log.borrow_mut().push(format!("enter-{worker}"));
                        // Hold the gate across a suspension point.
                        sleep(&rt2, 10).await;
                        log.borrow_mut().push(format!("leave-{worker}"));
                        drop(guard);
                    })
                    .unwrap();
                workers.push(fiber);
            }
            for fiber in &workers {
                fiber.join().await.unwrap();
            }

            // Sections never interleave: every enter is followed by its
            // own leave.
            let log = log.borrow();
            assert_eq!(log.len(), 6);
            for pair in log.chunks(2) {
                assert_eq!(pair[0].replace("enter", "x"), pair[1].replace("leave", "x"));
            }
        });
    }

    #[test]
    fn gate_no_wait_and_deadline() {
        with_runtime(|rt| async move {
            let gate = FiberGate::new(&rt);
            let held = gate.enter(0).await.unwrap();

            // Negative deadline: no waiting.
            assert_eq!(gate.enter(-1).await.err(), Some(Error::WouldBlock));
            // Short deadline while held: timeout.
            assert_eq!(
                gate.enter(ticks() + 30).await.err(),
                Some(Error::Timeout)
            );

            drop(held);
            let reacquired = gate.enter(ticks() + 30).await;
            assert!(reacquired.is_ok());
        });
    }

    #[test]
    fn sleep_suspends_for_roughly_the_delay() {
        with_runtime(|rt| async move {
            let before = ticks();
            sleep(&rt, 40).await;
            let elapsed = ticks() - before;
            assert!(elapsed >= 40, "woke after {elapsed}ms");
            assert!(elapsed < 2000, "woke after {elapsed}ms");
        });
    }

    #[test]
    fn resume_before_suspend_is_retained() {
        with_runtime(|rt| async move {
            let fiber = rt
                .spawn_fiber("late-suspender", async {
                    // Resume arrives while we are still busy.
                    crate::task::yield_now().await;
                    let value = suspend(()).await.unwrap();
                    assert_eq!(*value.downcast::<u32>().unwrap(), 9);
                })
                .unwrap();
            fiber.resume(9_u32).unwrap();
            // A second resume cannot pile up behind the first.
            assert_eq!(fiber.resume(10_u32), Err(Error::Busy));
            fiber.join().await.unwrap();
        });
    }
}
