// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Memory exhaustion policy.
//!
//! Allocation itself is the platform allocator. This module owns the one
//! process-wide policy hook: a handler invoked when a growth request trips
//! the configured ceiling or an allocation-scale limit, with a cause code
//! describing what went wrong. The growable containers ([`crate::buf::Buf`]
//! and [`crate::list::List`]) consult [`check_size`] before growing.

use crate::error::{Error, Result};
use crate::rerror;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Why the memory handler was invoked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemCause {
    /// A soft threshold was crossed. Advisory only.
    Warning,
    /// A policy limit was reached.
    Limit,
    /// The allocator reported failure.
    Fail,
    /// A single request exceeded the configured ceiling.
    TooBig,
    /// A fiber helper-thread stack was exhausted.
    Stack,
}

impl MemCause {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Limit => "limit",
            Self::Fail => "fail",
            Self::TooBig => "too big",
            Self::Stack => "stack",
        }
    }
}

/// Handler invoked on memory exhaustion. Receives the cause and the size of
/// the offending request.
pub type MemHandler = fn(cause: MemCause, size: usize);

static HANDLER: Mutex<Option<MemHandler>> = Mutex::new(None);

/// Per-request ceiling consulted by the growable containers. Zero means no
/// ceiling.
static CEILING: AtomicUsize = AtomicUsize::new(0);

/// Install a process-wide memory handler, replacing any previous one.
pub fn set_mem_handler(handler: MemHandler) {
    *HANDLER.lock().expect("mem handler lock poisoned") = Some(handler);
}

/// Set the per-request size ceiling. Requests above it are refused with
/// [`Error::WontFit`] after the handler runs. Zero disables the ceiling.
pub fn set_mem_ceiling(bytes: usize) {
    CEILING.store(bytes, Ordering::Relaxed);
}

/// Route an exhaustion condition through the installed handler.
///
/// The default handler logs the condition; for the fatal causes
/// ([`MemCause::Fail`] and [`MemCause::TooBig`] without an installed
/// handler) it terminates the process, as a safe-runtime cannot continue
/// without memory.
pub fn exhausted(cause: MemCause, size: usize) {
    let handler = *HANDLER.lock().expect("mem handler lock poisoned");
    match handler {
        Some(handler) => handler(cause, size),
        None => default_handler(cause, size),
    }
}

fn default_handler(cause: MemCause, size: usize) {
    rerror!(
        "mem",
        "memory exhaustion: cause {}, size {}",
        cause.as_str(),
        size
    );
    if matches!(cause, MemCause::Fail | MemCause::TooBig) {
        std::process::exit(255);
    }
}

/// Validate a container growth request against the configured ceiling.
///
/// # Errors
///
/// [`Error::WontFit`] when the request exceeds the ceiling. The memory
/// handler runs first with [`MemCause::TooBig`].
pub fn check_size(size: usize) -> Result<()> {
    let ceiling = CEILING.load(Ordering::Relaxed);
    if ceiling > 0 && size > ceiling {
        exhausted(MemCause::TooBig, size);
        return Err(Error::WontFit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    static FIRED: AtomicBool = AtomicBool::new(false);

    fn record(_cause: MemCause, _size: usize) {
        FIRED.store(true, Ordering::SeqCst);
    }

    // The ceiling is process-global and tests run in parallel, so probe it
    // with a size no real allocation ever reaches.
    #[test]
    fn ceiling_refuses_oversize_requests() {
        set_mem_handler(record);
        set_mem_ceiling(usize::MAX - 1);
        assert_eq!(check_size(usize::MAX - 1), Ok(()));
        assert_eq!(check_size(usize::MAX), Err(Error::WontFit));
        assert!(FIRED.load(Ordering::SeqCst));
        set_mem_ceiling(0);
        assert_eq!(check_size(usize::MAX), Ok(()));
    }
}
