// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime::Runtime;
use crate::time::timer::TimerKind;
use crate::time::{Ticks, ticks};
use core::pin::Pin;
use core::task::{Context, Poll};

/// Suspend the current fiber for `delay` ticks.
pub fn sleep(rt: &Runtime, delay: Ticks) -> Sleep {
    sleep_until(rt, ticks().saturating_add(delay.max(0)))
}

/// Suspend the current fiber until the absolute `deadline`.
pub fn sleep_until(rt: &Runtime, deadline: Ticks) -> Sleep {
    Sleep {
        rt: rt.clone(),
        deadline,
        timer: None,
        done: false,
    }
}

/// Future returned by [`sleep`] and [`sleep_until`]. Registers on the
/// runtime deadline heap on first poll and deregisters when dropped early.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    rt: Runtime,
    deadline: Ticks,
    timer: Option<u64>,
    done: bool,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let me = self.get_mut();
        if me.done {
            return Poll::Ready(());
        }
        if ticks() >= me.deadline {
            if let Some(id) = me.timer.take() {
                me.rt.inner.core.borrow_mut().timers.cancel(id);
            }
            me.done = true;
            return Poll::Ready(());
        }
        let mut core = me.rt.inner.core.borrow_mut();
        match me.timer {
            Some(id) => core.timers.reset_waker(id, cx.waker().clone()),
            None => {
                let id = me.rt.inner.shared.next_id();
                core.timers
                    .register(id, me.deadline, TimerKind::Wake(cx.waker().clone()));
                me.timer = Some(id);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if !self.done
            && let Some(id) = self.timer.take()
        {
            self.rt.inner.core.borrow_mut().timers.cancel(id);
        }
    }
}
