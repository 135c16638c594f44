// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::time::{Sleep, Ticks, sleep_until};
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::pin_project;

/// Bound `fut` by an absolute deadline on the tick clock. Deadline `0`
/// never expires.
pub fn timeout<F: Future>(rt: &Runtime, deadline: Ticks, fut: F) -> Timeout<F> {
    let sleep = (deadline > 0).then(|| sleep_until(rt, deadline));
    Timeout { fut, sleep }
}

/// Future returned by [`timeout`]. Yields `Err(Timeout)` when the
/// deadline wins the race.
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Timeout<F> {
    #[pin]
    fut: F,
    sleep: Option<Sleep>,
}

impl<F: Future> Future for Timeout<F> {
    type Output = Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(value) = this.fut.poll(cx) {
            return Poll::Ready(Ok(value));
        }
        if let Some(sleep) = this.sleep
            && Pin::new(sleep).poll(cx).is_ready()
        {
            return Poll::Ready(Err(Error::Timeout));
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::with_runtime;
    use crate::time::{sleep, ticks};

    #[test]
    fn completes_before_deadline() {
        with_runtime(|rt| async move {
            let out = timeout(&rt, ticks() + 5000, async { 7 }).await;
            assert_eq!(out, Ok(7));
        });
    }

    #[test]
    fn deadline_wins() {
        with_runtime(|rt| async move {
            let slow = sleep(&rt, 60_000);
            let out = timeout(&rt, ticks() + 30, slow).await;
            assert_eq!(out, Err(Error::Timeout));
        });
    }

    #[test]
    fn zero_deadline_never_expires() {
        with_runtime(|rt| async move {
            let out = timeout(&rt, 0, async {
                crate::task::yield_now().await;
                "done"
            })
            .await;
            assert_eq!(out, Ok("done"));
        });
    }
}
