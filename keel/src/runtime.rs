// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime: lifecycle state machine, the single-threaded service loop
//! and the thread-safe ingress.
//!
//! Exactly one OS thread runs fiber code. [`Runtime::service_events`]
//! (or [`Runtime::block_on`]) drives the loop on that thread: drain the
//! foreign-thread ingress, fire due timers and events, poll woken fibers,
//! then sleep in the I/O waiter until the next deadline or a wakeup.
//! Foreign threads interact only through [`Handle`] (and
//! [`Fiber::resume`](crate::fiber::Fiber::resume)): a mutex-protected
//! intake queue plus the waiter's wakeup channel.
//!
//! `Runtime::new` must precede any other call; [`Runtime::term`] is last.
//! `stop`, `graceful_stop` and the `Handle` surface are thread-safe; the
//! rest belongs to the main thread.

use core::cell::{Cell, RefCell};
use core::fmt;
use core::task::{Context, Poll, Waker};
use mio::{Events, Token};
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{EventQueue, WatchEntry};
use crate::fiber::{self, Fiber, FiberState};
use crate::sync::oneshot;
use crate::task::{LocalFuture, QueueWaker, Task, TaskId};
use crate::time::timer::{TimerHeap, TimerKind};
use crate::time::{Ticks, ticks};
use crate::wait::WaitState;
use crate::{rerror, rtrace};

pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Fiber stack bounds; the configured size applies to the helper threads
/// spawned for blocking work.
pub const MIN_FIBER_STACK: usize = 32 * 1024;
pub const MAX_FIBER_STACK: usize = 16 * 1024 * 1024;
const DEFAULT_FIBER_STACK: usize = 128 * 1024;

/// Runtime lifecycle states, in order.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum State {
    Started = 0,
    Initialized = 1,
    Ready = 2,
    Stopping = 3,
    Stopped = 4,
    Restart = 5,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Started,
            1 => Self::Initialized,
            2 => Self::Ready,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::Restart,
        }
    }
}

/// Construction knobs for [`Runtime::new`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Application name used by the log pipeline (`%A`).
    pub app_name: String,
    /// Stack size for helper threads, clamped to
    /// [`MIN_FIBER_STACK`]..=[`MAX_FIBER_STACK`].
    pub fiber_stack: usize,
    /// Cap on concurrently live fibers; `0` means unlimited.
    pub max_fibers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: String::from("app"),
            fiber_stack: DEFAULT_FIBER_STACK,
            max_fibers: 0,
        }
    }
}

/// Operations foreign threads enqueue for the main loop.
pub(crate) enum Ingress {
    Event {
        id: u64,
        deadline: Ticks,
        proc: Box<dyn FnOnce() + Send>,
    },
    Spawn {
        name: String,
        make: Box<dyn FnOnce() -> LocalFuture + Send>,
    },
    Signal {
        name: String,
    },
}

/// The thread-safe half of the runtime.
pub(crate) struct Shared {
    state: AtomicU8,
    graceful: AtomicBool,
    run_queue: Mutex<VecDeque<TaskId>>,
    ingress: Mutex<Vec<Ingress>>,
    waker: mio::Waker,
    ids: AtomicU64,
    pub(crate) fibers_alive: AtomicUsize,
    pub(crate) max_fibers: AtomicUsize,
    pub(crate) fiber_stack: AtomicUsize,
    pub(crate) io_timeouts: AtomicBool,
    main_thread: std::thread::ThreadId,
}

impl Shared {
    /// Fresh process-unique id. Starts at 1; 0 is never handed out.
    pub(crate) fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a task wakeup and kick the waiter out of its sleep.
    pub(crate) fn schedule(&self, id: TaskId) {
        self.run_queue
            .lock()
            .expect("run queue poisoned")
            .push_back(id);
        let _ = self.waker.wake();
    }

    fn pop_woken(&self) -> Option<TaskId> {
        self.run_queue.lock().expect("run queue poisoned").pop_front()
    }

    fn queue_ingress(&self, op: Ingress) {
        self.ingress.lock().expect("ingress poisoned").push(op);
        let _ = self.waker.wake();
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.main_thread
    }
}

/// Single-thread-only half: task slab, queues, registries.
pub(crate) struct Core {
    pub(crate) tasks: HashMap<TaskId, Task>,
    pub(crate) events: EventQueue,
    pub(crate) timers: TimerHeap,
    pub(crate) watches: HashMap<String, Vec<WatchEntry>>,
    pub(crate) waits: HashMap<Token, Rc<WaitState>>,
    pub(crate) registry: mio::Registry,
}

pub(crate) struct Inner {
    pub(crate) shared: Arc<Shared>,
    pub(crate) core: RefCell<Core>,
    poll: RefCell<mio::Poll>,
    io_events: RefCell<Events>,
    servicing: Cell<bool>,
}

thread_local! {
    static CURRENT: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// The runtime handle. Cheap to clone; confined to the main thread. Use
/// [`Runtime::handle`] for the thread-safe surface.
pub struct Runtime {
    pub(crate) inner: Rc<Inner>,
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("fibers", &self.inner.shared.fibers_alive.load(Ordering::Relaxed))
            .finish()
    }
}

// === impl Runtime: lifecycle ===

impl Runtime {
    /// Initialize the runtime on the calling thread, which becomes the
    /// main thread. Also applies the log pipeline environment overrides.
    ///
    /// # Errors
    ///
    /// [`Error::CantInitialize`] when the I/O waiter cannot be created.
    pub fn new(config: Config) -> Result<Self> {
        let poll = mio::Poll::new().map_err(|_| Error::CantInitialize)?;
        let waker =
            mio::Waker::new(poll.registry(), WAKE_TOKEN).map_err(|_| Error::CantInitialize)?;
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|_| Error::CantInitialize)?;

        crate::log::init_log(&config.app_name);

        let shared = Arc::new(Shared {
            state: AtomicU8::new(State::Started as u8),
            graceful: AtomicBool::new(false),
            run_queue: Mutex::new(VecDeque::new()),
            ingress: Mutex::new(Vec::new()),
            waker,
            ids: AtomicU64::new(1),
            fibers_alive: AtomicUsize::new(0),
            max_fibers: AtomicUsize::new(config.max_fibers),
            fiber_stack: AtomicUsize::new(
                config.fiber_stack.clamp(MIN_FIBER_STACK, MAX_FIBER_STACK),
            ),
            io_timeouts: AtomicBool::new(true),
            main_thread: std::thread::current().id(),
        });
        shared.set_state(State::Initialized);

        let rt = Self {
            inner: Rc::new(Inner {
                shared,
                core: RefCell::new(Core {
                    tasks: HashMap::new(),
                    events: EventQueue::new(),
                    timers: TimerHeap::new(),
                    watches: HashMap::new(),
                    waits: HashMap::new(),
                    registry,
                }),
                poll: RefCell::new(poll),
                io_events: RefCell::new(Events::with_capacity(128)),
                servicing: Cell::new(false),
            }),
        };
        rt.inner.shared.set_state(State::Ready);
        CURRENT.with_borrow_mut(|current| *current = Some(rt.clone()));
        rtrace!("runtime", "runtime ready");
        Ok(rt)
    }

    /// Tear down: drops every pending task, event, watch and wait. Must be
    /// the last runtime call on this thread.
    pub fn term(self) {
        self.inner.shared.set_state(State::Stopped);
        {
            let mut core = self.inner.core.borrow_mut();
            core.tasks.clear();
            core.events.clear();
            core.timers.clear();
            core.watches.clear();
            core.waits.clear();
        }
        CURRENT.with_borrow_mut(|current| {
            if current
                .as_ref()
                .is_some_and(|rt| Rc::ptr_eq(&rt.inner, &self.inner))
            {
                *current = None;
            }
        });
        rtrace!("runtime", "runtime terminated");
    }

    /// The thread-safe handle for foreign threads.
    #[must_use]
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.inner.shared.clone(),
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.inner.shared.state()
    }

    /// Stop immediately: pending events are discarded and the service loop
    /// wakes at once. Thread-safe.
    pub fn stop(&self) {
        self.inner.shared.set_state(State::Stopping);
        let _ = self.inner.shared.waker.wake();
    }

    /// Stop after everything already due or woken has drained.
    /// Thread-safe.
    pub fn graceful_stop(&self) {
        self.inner.shared.graceful.store(true, Ordering::Release);
        let _ = self.inner.shared.waker.wake();
    }

    /// Leave the service loop with [`State::Restart`] so the embedding
    /// process can re-initialize.
    pub fn restart(&self) {
        self.inner.shared.set_state(State::Restart);
        let _ = self.inner.shared.waker.wake();
    }

    /// Set the helper-thread stack size, clamped to the fiber stack
    /// bounds. Returns the effective size.
    pub fn set_fiber_stack(&self, size: usize) -> usize {
        let clamped = size.clamp(MIN_FIBER_STACK, MAX_FIBER_STACK);
        self.inner.shared.fiber_stack.store(clamped, Ordering::Relaxed);
        clamped
    }

    #[must_use]
    pub fn fiber_stack(&self) -> usize {
        self.inner.shared.fiber_stack.load(Ordering::Relaxed)
    }

    /// Cap concurrently live fibers; `0` means unlimited.
    pub fn set_fiber_limits(&self, max_fibers: usize) {
        self.inner.shared.max_fibers.store(max_fibers, Ordering::Relaxed);
    }

    /// Globally enable or disable I/O deadlines (debugging aid).
    pub fn set_io_timeouts(&self, enabled: bool) {
        self.inner.shared.io_timeouts.store(enabled, Ordering::Relaxed);
    }
}

// === impl Runtime: scheduling ===

impl Runtime {
    /// Spawn a fiber running `fut`. The fiber is scheduled immediately and
    /// first runs from the service loop.
    ///
    /// # Errors
    ///
    /// [`Error::TooMany`] past the fiber cap, [`Error::BadState`] while
    /// stopping.
    pub fn spawn_fiber<F>(&self, name: &str, fut: F) -> Result<Fiber>
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_boxed(name, Box::pin(fut))
    }

    pub(crate) fn spawn_boxed(&self, name: &str, fut: LocalFuture) -> Result<Fiber> {
        let shared = &self.inner.shared;
        if shared.state() >= State::Stopping {
            return Err(Error::BadState);
        }
        let max = shared.max_fibers.load(Ordering::Relaxed);
        if max > 0 && shared.fibers_alive.load(Ordering::Relaxed) >= max {
            rerror!("fiber", "fiber limit of {max} reached");
            return Err(Error::TooMany);
        }
        let id = shared.next_id();
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(FiberState::new(id, name, shared.clone(), rx));
        let wrapper: LocalFuture = Box::pin(async move {
            fut.await;
            let _ = tx.send(());
        });
        shared.fibers_alive.fetch_add(1, Ordering::Relaxed);
        self.inner.core.borrow_mut().tasks.insert(
            id,
            Task {
                fut: wrapper,
                name: name.into(),
                fiber: Some(state.clone()),
            },
        );
        shared.schedule(id);
        Ok(Fiber::from_state(state))
    }

    /// Run the service loop until the state reaches [`State::Stopping`]
    /// (or beyond). The immediate [`Runtime::stop`] discards whatever is
    /// still pending; [`Runtime::graceful_stop`] drains first.
    pub fn service_events(&self) {
        if self.inner.servicing.replace(true) {
            rerror!("runtime", "service loop already running");
            return;
        }
        while self.inner.shared.state() < State::Stopping {
            self.iterate();
        }
        self.finish_service();
    }

    /// Drive `fut` as the root fiber and service events until it
    /// completes or the runtime stops.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when the loop is already running on this thread,
    /// [`Error::Aborted`] when the runtime stopped (or the root fiber
    /// panicked) before producing a value, plus any spawn error.
    pub fn block_on<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        if self.inner.servicing.replace(true) {
            return Err(Error::Busy);
        }
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        let root = self.spawn_fiber("main", async move {
            *slot.borrow_mut() = Some(fut.await);
        });
        let root = match root {
            Ok(root) => root,
            Err(err) => {
                self.inner.servicing.set(false);
                return Err(err);
            }
        };
        while !root.is_done() && self.inner.shared.state() < State::Stopping {
            let root = root.clone();
            self.iterate_until(move || root.is_done());
        }
        self.finish_service();
        let out = result.borrow_mut().take();
        out.ok_or(Error::Aborted)
    }

    fn finish_service(&self) {
        self.inner.servicing.set(false);
        if self.inner.shared.state() >= State::Stopping
            && !self.inner.shared.graceful.load(Ordering::Acquire)
        {
            self.inner.core.borrow_mut().events.clear();
        }
    }

    /// One pass of the service loop.
    fn iterate(&self) {
        self.iterate_until(|| false);
    }

    /// One pass of the service loop; skips the waiter sleep once `done`
    /// reports completion so a finished [`Runtime::block_on`] root cannot
    /// leave the loop parked in the waiter.
    fn iterate_until<F: Fn() -> bool>(&self, done: F) {
        self.drain_ingress();
        self.fire_due_timers();
        let _ = self.run_due_events();
        self.drain_run_queue();

        if done() || self.inner.shared.state() >= State::Stopping {
            return;
        }
        if self.inner.shared.graceful.load(Ordering::Acquire) && self.is_drained() {
            self.inner.shared.set_state(State::Stopping);
            return;
        }
        let timeout = self.next_timeout();
        self.poll_io(timeout);
    }

    fn is_drained(&self) -> bool {
        if self.has_due_events() {
            return false;
        }
        let shared = &self.inner.shared;
        shared.run_queue.lock().expect("run queue poisoned").is_empty()
            && shared.ingress.lock().expect("ingress poisoned").is_empty()
    }

    fn drain_ingress(&self) {
        let ops: Vec<Ingress> = {
            let mut ingress = self.inner.shared.ingress.lock().expect("ingress poisoned");
            core::mem::take(&mut *ingress)
        };
        for op in ops {
            match op {
                Ingress::Event { id, deadline, proc } => {
                    self.inner.core.borrow_mut().events.insert(
                        id,
                        deadline,
                        crate::event::EventProc::Fiber(Box::new(move || {
                            Box::pin(async move { proc() }) as LocalFuture
                        })),
                    );
                }
                Ingress::Spawn { name, make } => {
                    if let Err(err) = self.spawn_boxed(&name, make()) {
                        rerror!("fiber", "cannot spawn '{name}' from ingress: {err}");
                    }
                }
                Ingress::Signal { name } => self.signal(&name),
            }
        }
    }

    fn drain_run_queue(&self) {
        while let Some(id) = self.inner.shared.pop_woken() {
            self.poll_task(id);
        }
    }

    fn fire_due_timers(&self) {
        let due = { self.inner.core.borrow_mut().timers.take_due(ticks()) };
        for kind in due {
            match kind {
                TimerKind::Wake(waker) => waker.wake(),
                TimerKind::WaitDeadline(token) => {
                    let found = self.inner.core.borrow().waits.get(&token).cloned();
                    if let Some(state) = found {
                        self.deliver_io_timeout(&state);
                    }
                }
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        {
            let shared = &self.inner.shared;
            if !shared.run_queue.lock().expect("run queue poisoned").is_empty()
                || !shared.ingress.lock().expect("ingress poisoned").is_empty()
            {
                return Some(Duration::ZERO);
            }
        }
        let mut core = self.inner.core.borrow_mut();
        let next_event = core.events.next_deadline();
        let next_timer = core.timers.next_deadline();
        let next = match (next_event, next_timer) {
            (Some(event), Some(timer)) => Some(event.min(timer)),
            (event, timer) => event.or(timer),
        };
        next.map(|deadline| {
            Duration::from_millis(u64::try_from((deadline - ticks()).max(0)).unwrap_or(0))
        })
    }

    fn poll_io(&self, timeout: Option<Duration>) {
        let mut events = self.inner.io_events.borrow_mut();
        let polled = self.inner.poll.borrow_mut().poll(&mut events, timeout);
        if let Err(err) = polled {
            if err.kind() != std::io::ErrorKind::Interrupted {
                rerror!("wait", "waiter poll failed: {err}");
            }
            return;
        }
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let bits = crate::wait::readiness(event);
            let found = self.inner.core.borrow().waits.get(&event.token()).cloned();
            if let Some(state) = found {
                self.deliver_io(&state, bits);
            }
        }
    }

    /// Poll one task, catching fiber panics so the loop survives them.
    fn poll_task(&self, id: TaskId) {
        let task = self.inner.core.borrow_mut().tasks.remove(&id);
        let Some(mut task) = task else {
            return;
        };
        let waker = Waker::from(Arc::new(QueueWaker {
            id,
            shared: self.inner.shared.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        let scope = fiber::enter_scope(task.fiber.clone());
        let polled = catch_unwind(AssertUnwindSafe(|| task.fut.as_mut().poll(&mut cx)));
        drop(scope);
        match polled {
            Ok(Poll::Pending) => {
                self.inner.core.borrow_mut().tasks.insert(id, task);
            }
            Ok(Poll::Ready(())) => self.retire(task),
            Err(panic) => {
                rerror!(
                    "fiber",
                    "fiber '{}' panicked: {}",
                    task.name,
                    panic_message(panic.as_ref())
                );
                self.retire(task);
            }
        }
    }

    fn retire(&self, task: Task) {
        if let Some(state) = task.fiber {
            state.finish();
            self.inner.shared.fibers_alive.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn panic_message(panic: &(dyn core::any::Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text
    } else {
        "unknown panic"
    }
}

/// The runtime installed on this thread by [`Runtime::new`].
#[must_use]
pub fn current() -> Option<Runtime> {
    CURRENT.with_borrow(Clone::clone)
}

// === impl Handle ===

/// Thread-safe ingress into the runtime for foreign OS threads.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Schedule `f` to run on a new fiber after `delay` ticks. Returns the
    /// event id.
    pub fn start_event<F>(&self, delay: Ticks, f: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.next_id();
        let deadline = ticks().saturating_add(delay.max(0));
        self.shared.queue_ingress(Ingress::Event {
            id,
            deadline,
            proc: Box::new(f),
        });
        id
    }

    /// Spawn a fiber from a foreign thread.
    pub fn spawn_fiber<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.queue_ingress(Ingress::Spawn {
            name: name.to_string(),
            make: Box::new(move || Box::pin(fut) as LocalFuture),
        });
    }

    /// Raise a watch signal from a foreign thread (asynchronous delivery).
    pub fn signal(&self, name: &str) {
        self.shared.queue_ingress(Ingress::Signal {
            name: name.to_string(),
        });
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// See [`Runtime::stop`]. Thread-safe.
    pub fn stop(&self) {
        self.shared.set_state(State::Stopping);
        let _ = self.shared.waker.wake();
    }

    /// See [`Runtime::graceful_stop`]. Thread-safe.
    pub fn graceful_stop(&self) {
        self.shared.graceful.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    /// True when called on the runtime's main thread.
    #[must_use]
    pub fn is_main_thread(&self) -> bool {
        self.shared.is_main_thread()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_runtime;
    use crate::time::sleep;

    #[test]
    fn lifecycle_states() {
        let rt = Runtime::new(Config::default()).unwrap();
        assert_eq!(rt.state(), State::Ready);
        let out = rt.block_on(async { 40 + 2 }).unwrap();
        assert_eq!(out, 42);
        rt.stop();
        assert_eq!(rt.state(), State::Stopping);
        rt.term();
    }

    #[test]
    fn block_on_returns_value_through_suspensions() {
        with_runtime(|rt| async move {
            sleep(&rt, 5).await;
            "done"
        });
    }

    #[test]
    fn spawned_fibers_run_and_join() {
        with_runtime(|rt| async move {
            let fiber = rt
                .spawn_fiber("worker", async {
                    crate::task::yield_now().await;
                })
                .unwrap();
            fiber.join().await.unwrap();
            assert!(fiber.is_done());
        });
    }

    // Property 4: resume(w) after suspend returns w from the suspension.
    #[test]
    fn suspend_resume_passes_values() {
        with_runtime(|rt| async move {
            let fiber = rt
                .spawn_fiber("suspender", async {
                    let value = crate::fiber::suspend("yielded").await.unwrap();
                    let value = value.downcast::<&str>().unwrap();
                    assert_eq!(*value, "resumed");
                })
                .unwrap();

            // Give the fiber a chance to park in suspend.
            sleep(&rt, 10).await;
            let yielded = fiber.take_yielded().unwrap();
            assert_eq!(*yielded.downcast::<&str>().unwrap(), "yielded");

            fiber.resume("resumed").unwrap();
            fiber.join().await.unwrap();
            assert_eq!(fiber.resume("late"), Err(Error::BadState));
        });
    }

    #[test]
    fn fiber_limit_enforced() {
        with_runtime(|rt| async move {
            rt.set_fiber_limits(2);
            // The root fiber counts, so one more fits.
            let held = rt
                .spawn_fiber("held", async {
                    let _ = crate::fiber::suspend(()).await;
                })
                .unwrap();
            let refused = rt.spawn_fiber("refused", async {});
            assert_eq!(refused.err(), Some(Error::TooMany));
            rt.set_fiber_limits(0);
            held.resume(()).unwrap();
            held.join().await.unwrap();
        });
    }

    #[test]
    fn fiber_stack_clamps() {
        with_runtime(|rt| async move {
            assert_eq!(rt.set_fiber_stack(1), MIN_FIBER_STACK);
            assert_eq!(rt.set_fiber_stack(usize::MAX), MAX_FIBER_STACK);
            assert_eq!(rt.set_fiber_stack(256 * 1024), 256 * 1024);
        });
    }

    // Scenario: cross-thread event ingress and synchronous signal chain.
    #[test]
    fn cross_thread_event_and_signal() {
        with_runtime(|rt| async move {
            let fiber = crate::fiber::current_fiber().unwrap();
            let watcher_fiber = fiber.clone();
            rt.watch("done", move |_, arg| {
                let detail = arg
                    .and_then(|arg| arg.downcast_ref::<&str>())
                    .copied()
                    .unwrap_or("?");
                let _ = watcher_fiber.resume(detail.to_string());
            });

            let handle = rt.handle();
            std::thread::spawn(move || {
                handle.start_event(0, move || {
                    // Runs on a fiber of the main thread.
                    let rt = crate::runtime::current().unwrap();
                    rt.signal_sync("done", Some(&"ok"));
                });
            });

            let value = crate::fiber::suspend(()).await.unwrap();
            assert_eq!(*value.downcast::<String>().unwrap(), "ok");
        });
    }

    #[test]
    fn graceful_stop_drains_due_work() {
        let rt = Runtime::new(Config::default()).unwrap();
        let done = Rc::new(Cell::new(false));
        let flag = done.clone();
        rt.start_event(0, move || async move {
            flag.set(true);
        });
        rt.graceful_stop();
        rt.service_events();
        assert!(done.get());
        assert!(rt.state() >= State::Stopping);
        rt.term();
    }

    #[test]
    fn stop_discards_pending_events() {
        let rt = Runtime::new(Config::default()).unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        let id = rt.start_event(60_000, move || async move {
            flag.set(true);
        });
        rt.stop();
        rt.service_events();
        assert!(!fired.get());
        assert!(!rt.lookup_event(id));
        rt.term();
    }
}
