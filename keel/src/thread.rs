// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Helper OS threads for blocking work.
//!
//! The runtime never blocks the main thread on a syscall other than the
//! waiter poll; DNS resolution, shell commands and other blocking calls
//! are relegated to a helper thread while the calling fiber suspends on a
//! oneshot for the result. Helper threads get the configured fiber stack
//! size and the platform's stack guard page.
//!
//! OS mutexes are `std::sync::Mutex`; the runtime's own rule stands: a
//! fiber must not hold one across a suspension point.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sync::oneshot;

/// Run `f` on a helper OS thread, suspending the calling fiber until its
/// result is available.
///
/// # Errors
///
/// [`Error::CantCreate`] when the thread cannot be spawned;
/// [`Error::Aborted`] when the helper panicked before producing a result.
pub async fn spawn_thread<T, F>(rt: &Runtime, name: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(rt.fiber_stack())
        .spawn(move || {
            let _ = tx.send(f());
        })
        .map_err(|_| Error::CantCreate)?;
    rx.await.map_err(|_| Error::Aborted)
}

/// Fire-and-forget helper thread with the configured stack size.
///
/// # Errors
///
/// [`Error::CantCreate`] when the thread cannot be spawned.
pub fn create_thread<F>(rt: &Runtime, name: &str, f: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .stack_size(rt.fiber_stack())
        .spawn(f)
        .map(|_| ())
        .map_err(|_| Error::CantCreate)
}
