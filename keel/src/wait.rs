// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The I/O waiter.
//!
//! One `mio::Poll` per runtime multiplexes every registered descriptor
//! (epoll on Linux, kqueue on the BSDs and macOS, the mio fallback
//! elsewhere) and a wakeup channel that foreign threads write to through
//! the scheduler ingress. A [`Wait`] is one registration: a fiber suspends
//! on it with [`Wait::wait_for_io`], or a handler is installed that the
//! loop runs on a new fiber whenever readiness (or the deadline) arrives.
//!
//! Cancellation is observable: freeing a wait resumes a blocked fiber with
//! the empty mask, and [`Wait::resume_io`] injects a synthetic mask.

use bitflags::bitflags;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use mio::Token;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::rerror;
use crate::runtime::Runtime;
use crate::task::LocalFuture;
use crate::time::timer::TimerKind;
use crate::time::{Ticks, ticks};

bitflags! {
    /// Readiness mask bits.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Ready: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const MODIFIED = 1 << 2;
        const TIMEOUT = 1 << 3;
    }
}

/// Map an observed poll event to mask bits. Errors and hangups surface as
/// both directions so a blocked fiber wakes and observes the condition on
/// its descriptor.
pub(crate) fn readiness(event: &mio::event::Event) -> Ready {
    let mut bits = Ready::empty();
    if event.is_readable() || event.is_read_closed() {
        bits |= Ready::READABLE;
    }
    if event.is_writable() || event.is_write_closed() {
        bits |= Ready::WRITABLE;
    }
    if event.is_priority() {
        bits |= Ready::MODIFIED;
    }
    if event.is_error() {
        bits |= Ready::READABLE | Ready::WRITABLE;
    }
    bits
}

type WaitHandler = Rc<dyn Fn(Ready) -> LocalFuture>;

struct HandlerEntry {
    proc: WaitHandler,
    mask: Ready,
    timer: Option<u64>,
}

pub(crate) struct WaitState {
    token: Token,
    pending: Cell<Ready>,
    resumed: Cell<bool>,
    dead: Cell<bool>,
    owner_waker: RefCell<Option<Waker>>,
    owner_active: Cell<bool>,
    handler: RefCell<Option<HandlerEntry>>,
}

impl WaitState {
    fn wake_owner(&self) {
        if let Some(waker) = self.owner_waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

/// A registration with the I/O waiter.
pub struct Wait {
    rt: Runtime,
    state: Rc<WaitState>,
}

// === impl Runtime: waiter ===

impl Runtime {
    /// Register `source` with the waiter for both directions of readiness.
    ///
    /// # Errors
    ///
    /// [`Error::CantOpen`] when the descriptor cannot be registered.
    pub fn alloc_wait<S>(&self, source: &mut S) -> Result<Wait>
    where
        S: mio::event::Source + ?Sized,
    {
        let token = Token(usize::try_from(self.inner.shared.next_id()).map_err(|_| Error::TooMany)?);
        let state = Rc::new(WaitState {
            token,
            pending: Cell::new(Ready::empty()),
            resumed: Cell::new(false),
            dead: Cell::new(false),
            owner_waker: RefCell::new(None),
            owner_active: Cell::new(false),
            handler: RefCell::new(None),
        });
        {
            let mut core = self.inner.core.borrow_mut();
            core.registry
                .register(
                    source,
                    token,
                    mio::Interest::READABLE | mio::Interest::WRITABLE,
                )
                .map_err(|_| Error::CantOpen)?;
            core.waits.insert(token, state.clone());
        }
        Ok(Wait {
            rt: self.clone(),
            state,
        })
    }

    /// Deliver observed readiness for a registration: wake a blocked
    /// fiber, or dispatch the installed handler on a new fiber.
    pub(crate) fn deliver_io(&self, state: &Rc<WaitState>, bits: Ready) {
        if state.dead.get() {
            return;
        }
        state.pending.set(state.pending.get() | bits);
        if state.owner_active.get() {
            state.wake_owner();
            return;
        }
        let fire = {
            let handler = state.handler.borrow();
            handler.as_ref().and_then(|entry| {
                let hit = state.pending.get() & entry.mask;
                (!hit.is_empty()).then(|| (entry.proc.clone(), hit))
            })
        };
        if let Some((proc, hit)) = fire {
            state.pending.set(state.pending.get() - hit);
            if let Err(err) = self.spawn_boxed("wait", proc(hit)) {
                rerror!("wait", "cannot spawn wait handler: {err}");
            }
        }
    }

    /// A handler-armed registration hit its deadline.
    pub(crate) fn deliver_io_timeout(&self, state: &Rc<WaitState>) {
        if state.dead.get() {
            return;
        }
        if state.owner_active.get() {
            state.wake_owner();
            return;
        }
        let fire = {
            let mut handler = state.handler.borrow_mut();
            handler.as_mut().map(|entry| {
                entry.timer = None;
                entry.proc.clone()
            })
        };
        if let Some(proc) = fire
            && let Err(err) = self.spawn_boxed("wait", proc(Ready::TIMEOUT))
        {
            rerror!("wait", "cannot spawn wait handler: {err}");
        }
    }
}

// === impl Wait ===

impl Wait {
    /// Install `handler` to run on a new fiber whenever a bit of `mask`
    /// fires, or once when the absolute `deadline` passes (mask
    /// [`Ready::TIMEOUT`]). Deadline `0` means none.
    pub fn set_handler<F, Fut>(&self, mask: Ready, deadline: Ticks, handler: F)
    where
        F: Fn(Ready) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let proc: WaitHandler = Rc::new(move |bits| Box::pin(handler(bits)) as LocalFuture);
        let timer = self.arm_deadline(deadline);
        let previous = self.state.handler.replace(Some(HandlerEntry {
            proc,
            mask,
            timer,
        }));
        if let Some(entry) = previous {
            self.cancel_timer(entry.timer);
        }
    }

    /// Adjust the mask and deadline of an installed handler.
    ///
    /// # Errors
    ///
    /// [`Error::BadState`] when no handler is installed.
    pub fn set_mask(&self, mask: Ready, deadline: Ticks) -> Result<()> {
        let timer = self.arm_deadline(deadline);
        let mut handler = self.state.handler.borrow_mut();
        let Some(entry) = handler.as_mut() else {
            drop(handler);
            self.cancel_timer(timer);
            return Err(Error::BadState);
        };
        entry.mask = mask;
        let stale = core::mem::replace(&mut entry.timer, timer);
        drop(handler);
        self.cancel_timer(stale);
        Ok(())
    }

    fn arm_deadline(&self, deadline: Ticks) -> Option<u64> {
        if deadline <= 0 || !self.rt.inner.shared.io_timeouts.load(Ordering::Relaxed) {
            return None;
        }
        let id = self.rt.inner.shared.next_id();
        self.rt.inner.core.borrow_mut().timers.register(
            id,
            deadline,
            TimerKind::WaitDeadline(self.state.token),
        );
        Some(id)
    }

    fn cancel_timer(&self, timer: Option<u64>) {
        if let Some(id) = timer {
            self.rt.inner.core.borrow_mut().timers.cancel(id);
        }
    }

    /// Suspend the calling fiber until a bit of `mask` fires, the absolute
    /// `deadline` passes, or the wait is freed. Returns the observed mask:
    /// [`Ready::TIMEOUT`] on deadline, the empty mask on cancellation.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when another fiber is already blocked here.
    pub fn wait_for_io(&self, mask: Ready, deadline: Ticks) -> WaitIo {
        WaitIo {
            rt: self.rt.clone(),
            state: self.state.clone(),
            mask,
            deadline,
            timer: None,
            entered: false,
            done: false,
        }
    }

    /// Wake a blocked fiber with a synthetic mask (may be empty).
    pub fn resume_io(&self, mask: Ready) {
        self.state.pending.set(self.state.pending.get() | mask);
        self.state.resumed.set(true);
        if self.state.owner_active.get() {
            self.state.wake_owner();
        }
    }

    /// Deregister. A fiber blocked in [`Self::wait_for_io`] resumes with
    /// the empty mask.
    pub fn free<S>(&self, source: &mut S)
    where
        S: mio::event::Source + ?Sized,
    {
        if self.state.dead.replace(true) {
            return;
        }
        let timer = self
            .state
            .handler
            .borrow_mut()
            .take()
            .and_then(|entry| entry.timer);
        self.cancel_timer(timer);
        {
            let mut core = self.rt.inner.core.borrow_mut();
            let _ = core.registry.deregister(source);
            core.waits.remove(&self.state.token);
        }
        self.state.wake_owner();
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        if self.state.dead.replace(true) {
            return;
        }
        // Without the source we cannot deregister from the OS here; the
        // registration dies with the descriptor. Drop the bookkeeping and
        // release any blocked fiber.
        let timer = self
            .state
            .handler
            .borrow_mut()
            .take()
            .and_then(|entry| entry.timer);
        self.cancel_timer(timer);
        self.rt
            .inner
            .core
            .borrow_mut()
            .waits
            .remove(&self.state.token);
        self.state.wake_owner();
    }
}

impl fmt::Debug for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("token", &self.state.token.0)
            .field("pending", &self.state.pending.get())
            .field("dead", &self.state.dead.get())
            .finish()
    }
}

/// Future returned by [`Wait::wait_for_io`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WaitIo {
    rt: Runtime,
    state: Rc<WaitState>,
    mask: Ready,
    deadline: Ticks,
    timer: Option<u64>,
    entered: bool,
    done: bool,
}

impl Future for WaitIo {
    type Output = Result<Ready>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let me = self.get_mut();
        if !me.entered {
            if me.state.owner_active.get() {
                me.done = true;
                return Poll::Ready(Err(Error::Busy));
            }
            me.state.owner_active.set(true);
            me.entered = true;
        }
        if me.state.dead.get() {
            me.finish();
            return Poll::Ready(Ok(Ready::empty()));
        }
        let hit = me.state.pending.get() & (me.mask | Ready::TIMEOUT);
        if !hit.is_empty() {
            me.state.pending.set(me.state.pending.get() - hit);
            me.state.resumed.set(false);
            me.finish();
            return Poll::Ready(Ok(hit));
        }
        if me.state.resumed.replace(false) {
            me.finish();
            return Poll::Ready(Ok(Ready::empty()));
        }
        let deadline = me.effective_deadline();
        if deadline > 0 && ticks() >= deadline {
            me.finish();
            return Poll::Ready(Ok(Ready::TIMEOUT));
        }
        *me.state.owner_waker.borrow_mut() = Some(cx.waker().clone());
        if deadline > 0 {
            let mut core = me.rt.inner.core.borrow_mut();
            match me.timer {
                Some(id) => core.timers.reset_waker(id, cx.waker().clone()),
                None => {
                    let id = me.rt.inner.shared.next_id();
                    core.timers
                        .register(id, deadline, TimerKind::Wake(cx.waker().clone()));
                    me.timer = Some(id);
                }
            }
        }
        Poll::Pending
    }
}

impl WaitIo {
    fn effective_deadline(&self) -> Ticks {
        if self.rt.inner.shared.io_timeouts.load(Ordering::Relaxed) {
            self.deadline
        } else {
            0
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.state.owner_active.set(false);
        self.state.owner_waker.borrow_mut().take();
        if let Some(id) = self.timer.take() {
            self.rt.inner.core.borrow_mut().timers.cancel(id);
        }
    }
}

impl Drop for WaitIo {
    fn drop(&mut self) {
        if self.entered && !self.done {
            self.finish();
        }
    }
}
