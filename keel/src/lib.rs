// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Portable safe-runtime core for embedded agents.
//!
//! `keel` is the layer everything else in an agent stands on: a
//! single-threaded cooperative scheduler whose fibers suspend only at
//! explicit points, an integrated event/timer/wait loop over the
//! platform's readiness facility, non-blocking TCP that suspends the
//! calling fiber, and the supporting primitives — growable byte buffer,
//! list, ordered map, red-black tree, value utilities, a filtered log
//! pipeline.
//!
//! The shape of an embedding:
//!
//! ```no_run
//! use keel::runtime::{Config, Runtime};
//!
//! fn main() -> keel::Result<()> {
//!     let rt = Runtime::new(Config::default())?;
//!     let main = rt.clone();
//!     rt.spawn_fiber("main", async move {
//!         // connect sockets, schedule events, watch signals...
//!         let _ = main;
//!     })?;
//!     rt.service_events();
//!     rt.term();
//!     Ok(())
//! }
//! ```
//!
//! Deadlines across the API are absolute values of the monotonic tick
//! clock ([`time::ticks`], milliseconds); `0` means "no deadline".
//! Failures are values from the closed [`Error`] code set; nothing in the
//! core panics across the API boundary, and a panicking fiber is retired
//! without destabilizing the loop.

pub mod buf;
pub mod error;
pub mod event;
pub mod fiber;
pub mod list;
pub mod log;
pub mod map;
pub mod mem;
pub mod net;
pub mod rb;
pub mod run;
pub mod runtime;
pub mod string;
pub mod sync;
mod task;
pub mod thread;
pub mod time;
pub mod wait;

#[cfg(test)]
mod test_util;

pub use buf::Buf;
pub use error::{Error, Result};
pub use event::{EventFlags, EventId, WatchId};
pub use fiber::{Fiber, FiberGate, current_fiber, is_main, suspend};
pub use list::List;
pub use map::{Map, MapFlags};
pub use net::{Socket, SocketConfig, check_internet, set_default_certs};
pub use rb::{RbFlags, RbTree};
pub use run::run;
pub use runtime::{Config, Handle, Runtime, State, current};
pub use task::{YieldNow, yield_now};
pub use thread::{create_thread, spawn_thread};
pub use time::{Ticks, sleep, sleep_until, ticks, timeout};
pub use wait::{Ready, Wait};
