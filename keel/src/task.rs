// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task storage for the single-threaded scheduler.
//!
//! A task is a boxed future plus bookkeeping. Wakers are cheap handles that
//! push the task id onto the shared run queue and kick the I/O waiter, so a
//! wake from a foreign thread interrupts the poll sleep.

use crate::fiber::FiberState;
use crate::runtime::Shared;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;
use std::task::Wake;

pub(crate) type TaskId = u64;

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

pub(crate) struct Task {
    pub(crate) fut: LocalFuture,
    pub(crate) name: Box<str>,
    pub(crate) fiber: Option<Arc<FiberState>>,
}

/// Waker for one task. `Send + Sync`; waking from any thread funnels
/// through [`Shared::schedule`].
pub(crate) struct QueueWaker {
    pub(crate) id: TaskId,
    pub(crate) shared: Arc<Shared>,
}

impl Wake for QueueWaker {
    fn wake(self: Arc<Self>) {
        self.shared.schedule(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.schedule(self.id);
    }
}

/// Yield once to the scheduler, letting other due work run.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

/// Future returned by [`yield_now`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
#[derive(Debug)]
pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            Poll::Ready(())
        } else {
            self.polled = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
