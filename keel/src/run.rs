// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Run a shell command, capturing stdout.
//!
//! The child runs under `/bin/sh -c` on a helper thread so the calling
//! fiber suspends rather than blocks. The command string is passed to the
//! shell unescaped; callers must sanitize anything caller-controlled.

use crate::error::{Error, Result};
use crate::runtime::Runtime;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use crate::thread::spawn_thread;

        /// Run `command` and return `(exit_status, stdout)`.
        ///
        /// # Errors
        ///
        /// [`Error::CantCreate`] when the child cannot be started.
        pub async fn run(rt: &Runtime, command: &str) -> Result<(i32, String)> {
            let command = command.to_string();
            let output = spawn_thread(rt, "run", move || {
                std::process::Command::new("/bin/sh")
                    .arg("-c")
                    .arg(&command)
                    .output()
            })
            .await?;
            let output = output.map_err(|_| Error::CantCreate)?;
            let status = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            Ok((status, stdout))
        }
    } else {
        /// Shell execution is unavailable on this platform.
        ///
        /// # Errors
        ///
        /// Always [`Error::BadState`].
        pub async fn run(_rt: &Runtime, _command: &str) -> Result<(i32, String)> {
            Err(Error::BadState)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_util::with_runtime;

    #[test]
    fn captures_stdout_and_status() {
        with_runtime(|rt| async move {
            let (status, out) = run(&rt, "echo one && echo two").await.unwrap();
            assert_eq!(status, 0);
            assert_eq!(out, "one\ntwo\n");
        });
    }

    #[test]
    fn nonzero_exit_status() {
        with_runtime(|rt| async move {
            let (status, out) = run(&rt, "exit 3").await.unwrap();
            assert_eq!(status, 3);
            assert_eq!(out, "");
        });
    }
}
