// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Test harness: one runtime per test, torn down afterwards.

use crate::runtime::{Config, Runtime};

/// Initialize a runtime, drive `f`'s future as the root fiber to
/// completion, terminate, and hand back the result.
pub(crate) fn with_runtime<F, Fut, T>(f: F) -> T
where
    F: FnOnce(Runtime) -> Fut,
    Fut: Future<Output = T> + 'static,
    T: 'static,
{
    let rt = Runtime::new(Config::default()).expect("runtime init");
    let out = rt.block_on(f(rt.clone())).expect("root fiber failed");
    rt.term();
    out
}
