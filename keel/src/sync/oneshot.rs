// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Single-value channel whose send resumes the waiting task.
//!
//! This is the resume primitive behind fiber joins and
//! [`spawn_thread`](crate::thread::spawn_thread): the sender side may live
//! on a foreign OS thread, the receiver is a future polled on the main
//! fiber. Dropping the sender without sending closes the channel and the
//! receiver observes [`RecvError`].

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::{Arc, Mutex};

pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        slot: Mutex::new(Slot {
            value: None,
            waker: None,
            closed: false,
        }),
    });
    (
        Sender {
            inner: Some(inner.clone()),
        },
        Receiver { inner },
    )
}

/// The channel closed without a value (sender dropped or receiver closed).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecvError(pub(crate) ());

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("channel closed")
    }
}

impl core::error::Error for RecvError {}

struct Slot<T> {
    value: Option<T>,
    waker: Option<Waker>,
    closed: bool,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
}

pub struct Sender<T> {
    inner: Option<Arc<Inner<T>>>,
}

pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

// === impl Sender ===

impl<T> Sender<T> {
    /// Send the value, waking the receiver. Returns the value back if the
    /// receiver is already gone.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let inner = self.inner.take().expect("sender used once");
        let waker = {
            let mut slot = inner.slot.lock().expect("oneshot lock poisoned");
            if slot.closed {
                return Err(value);
            }
            slot.value = Some(value);
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// True when the receiver has been closed or dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let inner = self.inner.as_ref().expect("sender used once");
        inner.slot.lock().expect("oneshot lock poisoned").closed
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let waker = {
            let mut slot = inner.slot.lock().expect("oneshot lock poisoned");
            slot.closed = true;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Sender")
    }
}

// === impl Receiver ===

impl<T> Receiver<T> {
    /// Take the value if it has already arrived.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner
            .slot
            .lock()
            .expect("oneshot lock poisoned")
            .value
            .take()
    }

    /// Refuse any future send. A value sent before the close is still
    /// delivered.
    pub fn close(&mut self) {
        self.inner
            .slot
            .lock()
            .expect("oneshot lock poisoned")
            .closed = true;
    }
}

impl<T> Future for Receiver<T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.inner.slot.lock().expect("oneshot lock poisoned");
        if let Some(value) = slot.value.take() {
            return Poll::Ready(Ok(value));
        }
        if slot.closed {
            return Poll::Ready(Err(RecvError(())));
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Receiver")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn poll_once<T>(rx: &mut Receiver<T>) -> (Poll<Result<T, RecvError>>, Arc<Flag>) {
        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(flag.clone());
        let mut cx = Context::from_waker(&waker);
        (Pin::new(rx).poll(&mut cx), flag)
    }

    #[test]
    fn send_then_recv() {
        let (tx, mut rx) = channel();
        tx.send(42).unwrap();
        let (polled, _) = poll_once(&mut rx);
        assert_eq!(polled, Poll::Ready(Ok(42)));
    }

    #[test]
    fn recv_then_send_wakes() {
        let (tx, mut rx) = channel();
        let (polled, flag) = poll_once(&mut rx);
        assert_eq!(polled, Poll::Pending);
        tx.send(7).unwrap();
        assert!(flag.0.load(std::sync::atomic::Ordering::SeqCst));
        let (polled, _) = poll_once(&mut rx);
        assert_eq!(polled, Poll::Ready(Ok(7)));
    }

    #[test]
    fn dropped_sender_closes() {
        let (tx, mut rx) = channel::<u32>();
        drop(tx);
        let (polled, _) = poll_once(&mut rx);
        assert_eq!(polled, Poll::Ready(Err(RecvError(()))));
    }

    #[test]
    fn closed_receiver_refuses() {
        let (tx, mut rx) = channel();
        rx.close();
        assert!(tx.is_closed());
        assert_eq!(tx.send(1), Err(1));
    }

    #[test]
    fn cross_thread_send() {
        let (tx, mut rx) = channel();
        let join = std::thread::spawn(move || tx.send("from-thread").unwrap());
        join.join().unwrap();
        assert_eq!(rx.try_recv(), Some("from-thread"));
    }
}
