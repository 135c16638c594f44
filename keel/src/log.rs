// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Filtered log pipeline.
//!
//! Configured by a spec of the form `destination:types:sources` where the
//! destination is a path, `stdout`, `stderr` or `none`, and the two filters
//! are comma lists with `!` negation and the special token `all`. Messages
//! carry a (type, source) pair; [`emit_log`] exposes the filter decision so
//! expensive message construction can be skipped. Rendering goes through a
//! format template (`%A` app, `%D` date, `%H` host, `%P` pid, `%S` source,
//! `%T` type, `%M` message); the `raw` type bypasses the template. File
//! destinations rotate at a size limit keeping a bounded set of backups.
//!
//! The pipeline is process-global and usable before the runtime starts.
//! Emission failures are swallowed; logging never propagates errors.

use crate::time;
use std::fmt;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

const DEFAULT_TYPES: &str = "error,info";
const DEFAULT_SOURCES: &str = "all";
const DEFAULT_FORMAT: &str = "%D %T %S %M";
const DEFAULT_MAX_SIZE: u64 = 2 * 1024 * 1024;
const DEFAULT_BACKUPS: u32 = 5;
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Installed with [`set_log_handler`] to redirect messages. Receives
/// (type, source, message).
pub type LogHandler = std::sync::Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

struct Filter {
    all: bool,
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl Filter {
    fn parse(spec: &str) -> Self {
        let mut filter = Self {
            all: false,
            include: HashSet::new(),
            exclude: HashSet::new(),
        };
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some(negated) = token.strip_prefix('!') {
                if negated == "all" {
                    filter.all = false;
                    filter.include.clear();
                } else {
                    filter.exclude.insert(negated.to_string());
                }
            } else if token == "all" {
                filter.all = true;
            } else {
                filter.include.insert(token.to_string());
            }
        }
        filter
    }

    fn matches(&self, token: &str) -> bool {
        if self.exclude.contains(token) {
            return false;
        }
        self.all || self.include.contains(token)
    }
}

enum Dest {
    Stdout,
    Stderr,
    Discard,
    File {
        path: PathBuf,
        file: Option<File>,
        written: u64,
    },
}

struct LogState {
    dest: Dest,
    types: Filter,
    sources: Filter,
    format: String,
    app: String,
    host: String,
    handler: Option<LogHandler>,
    max_size: u64,
    backups: u32,
    spec_forced: bool,
    format_forced: bool,
}

impl LogState {
    fn new() -> Self {
        Self {
            dest: Dest::Stderr,
            types: Filter::parse(DEFAULT_TYPES),
            sources: Filter::parse(DEFAULT_SOURCES),
            format: DEFAULT_FORMAT.to_string(),
            app: String::from("app"),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            handler: None,
            max_size: DEFAULT_MAX_SIZE,
            backups: DEFAULT_BACKUPS,
            spec_forced: false,
            format_forced: false,
        }
    }
}

fn state() -> &'static Mutex<LogState> {
    static LOG: OnceLock<Mutex<LogState>> = OnceLock::new();
    LOG.get_or_init(|| Mutex::new(LogState::new()))
}

fn parse_dest(token: &str) -> Dest {
    match token {
        "stdout" => Dest::Stdout,
        "" | "stderr" => Dest::Stderr,
        "none" => Dest::Discard,
        path => Dest::File {
            path: PathBuf::from(path),
            file: None,
            written: 0,
        },
    }
}

/// Configure from a `destination:types:sources` spec. A forced
/// configuration wins over later unforced ones (environment overrides use
/// unforced configuration).
pub fn set_log(spec: &str, force: bool) {
    let mut log = state().lock().expect("log lock poisoned");
    if log.spec_forced && !force {
        return;
    }
    let mut parts = spec.splitn(3, ':');
    log.dest = parse_dest(parts.next().unwrap_or(""));
    log.types = Filter::parse(parts.next().unwrap_or(DEFAULT_TYPES));
    log.sources = Filter::parse(parts.next().unwrap_or(DEFAULT_SOURCES));
    log.spec_forced = force;
}

/// Set the message format template.
pub fn set_log_format(format: &str, force: bool) {
    let mut log = state().lock().expect("log lock poisoned");
    if log.format_forced && !force {
        return;
    }
    log.format = format.to_string();
    log.format_forced = force;
}

/// Redirect messages to `handler` instead of the configured destination.
pub fn set_log_handler(handler: LogHandler) {
    state().lock().expect("log lock poisoned").handler = Some(handler);
}

/// Remove an installed handler.
pub fn clear_log_handler() {
    state().lock().expect("log lock poisoned").handler = None;
}

/// Set the rotation policy for file destinations.
pub fn set_log_limits(max_size: u64, backups: u32) {
    let mut log = state().lock().expect("log lock poisoned");
    log.max_size = max_size;
    log.backups = backups;
}

/// Install the application name (`%A`) and apply `LOG_FILTER` /
/// `LOG_FORMAT` environment overrides.
pub fn init_log(app: &str) {
    {
        state().lock().expect("log lock poisoned").app = app.to_string();
    }
    if let Ok(spec) = std::env::var("LOG_FILTER") {
        set_log(&spec, false);
    }
    if let Ok(format) = std::env::var("LOG_FORMAT") {
        set_log_format(&format, false);
    }
}

/// Would a message of (type, source) be emitted? Call before building an
/// expensive message.
#[must_use]
pub fn emit_log(kind: &str, source: &str) -> bool {
    let log = state().lock().expect("log lock poisoned");
    log.types.matches(kind) && log.sources.matches(source)
}

/// Emit a message. Prefer the [`rlog!`](crate::rlog) family of macros.
pub fn log_msg(kind: &str, source: &str, args: fmt::Arguments<'_>) {
    let mut log = state().lock().expect("log lock poisoned");
    if !(log.types.matches(kind) && log.sources.matches(source)) {
        return;
    }
    let message = fmt::format(args);
    if let Some(handler) = log.handler.clone() {
        // Run the handler outside the lock so it may log itself.
        drop(log);
        handler(kind, source, &message);
        return;
    }
    let line = if kind == "raw" {
        message
    } else {
        render(&log, kind, source, &message)
    };
    write_line(&mut log, &line);
}

fn render(log: &LogState, kind: &str, source: &str, message: &str) -> String {
    let mut out = String::with_capacity(log.format.len() + message.len() + 32);
    let mut chars = log.format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('A') => out.push_str(&log.app),
            Some('D') => {
                out.push_str(&time::get_date(Some(DATE_FORMAT)).unwrap_or_default());
            }
            Some('H') => out.push_str(&log.host),
            Some('P') => out.push_str(&std::process::id().to_string()),
            Some('S') => out.push_str(source),
            Some('T') => out.push_str(kind),
            Some('M') => out.push_str(message),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn write_line(log: &mut LogState, line: &str) {
    match &mut log.dest {
        Dest::Stdout => {
            let _ = writeln!(std::io::stdout(), "{line}");
        }
        Dest::Stderr => {
            let _ = writeln!(std::io::stderr(), "{line}");
        }
        Dest::Discard => {}
        Dest::File { .. } => write_file(log, line),
    }
}

fn write_file(log: &mut LogState, line: &str) {
    let max_size = log.max_size;
    let backups = log.backups;
    let Dest::File {
        path,
        file,
        written,
    } = &mut log.dest
    else {
        return;
    };
    if file.is_none() {
        let Ok(handle) = OpenOptions::new().create(true).append(true).open(&*path) else {
            return;
        };
        *written = handle.metadata().map(|meta| meta.len()).unwrap_or(0);
        *file = Some(handle);
    }
    let len = line.len() as u64 + 1;
    if *written + len > max_size {
        *file = None;
        rotate(path, backups);
        let Ok(handle) = OpenOptions::new().create(true).append(true).open(&*path) else {
            return;
        };
        *written = 0;
        *file = Some(handle);
    }
    if let Some(handle) = file
        && writeln!(handle, "{line}").is_ok()
    {
        *written += len;
    }
}

/// `app.log` rotates through `app-1.log` .. `app-N.log`, newest first.
fn backup_path(path: &Path, index: u32) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
    let name = match path.extension() {
        Some(ext) => format!("{stem}-{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{index}"),
    };
    path.with_file_name(name)
}

fn rotate(path: &Path, backups: u32) {
    if backups == 0 {
        let _ = std::fs::remove_file(path);
        return;
    }
    let _ = std::fs::remove_file(backup_path(path, backups));
    for index in (1..backups).rev() {
        let _ = std::fs::rename(backup_path(path, index), backup_path(path, index + 1));
    }
    let _ = std::fs::rename(path, backup_path(path, 1));
}

/// Log at an explicit type: `rlog!("trace", "db", "opened {}", path)`.
#[macro_export]
macro_rules! rlog {
    ($kind:expr, $source:expr, $($arg:tt)*) => {
        $crate::log::log_msg($kind, $source, core::format_args!($($arg)*))
    };
}

/// Log an error: `rerror!("socket", "connect failed: {}", err)`.
#[macro_export]
macro_rules! rerror {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log_msg("error", $source, core::format_args!($($arg)*))
    };
}

/// Log at info level.
#[macro_export]
macro_rules! rinfo {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log_msg("info", $source, core::format_args!($($arg)*))
    };
}

/// Log at trace level.
#[macro_export]
macro_rules! rtrace {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log_msg("trace", $source, core::format_args!($($arg)*))
    };
}

/// Log at debug level.
#[macro_export]
macro_rules! rdebug {
    ($source:expr, $($arg:tt)*) => {
        $crate::log::log_msg("debug", $source, core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    // The pipeline is process-global; tests that reconfigure it serialize
    // here and restore the defaults before releasing the lock.
    static SERIAL: StdMutex<()> = StdMutex::new(());

    fn reset() {
        set_log("stderr:error,info:all", true);
        set_log_format(DEFAULT_FORMAT, true);
        clear_log_handler();
        set_log_limits(DEFAULT_MAX_SIZE, DEFAULT_BACKUPS);
        let mut log = state().lock().unwrap();
        log.spec_forced = false;
        log.format_forced = false;
    }

    fn temp_path(tag: &str) -> PathBuf {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!(
            "keel-log-{}-{tag}-{seq}.log",
            std::process::id()
        ))
    }

    // Scenario: spec `stderr:error,info,!trace:all,!mbedtls`.
    #[test]
    fn filter_truth_table() {
        let _serial = SERIAL.lock().unwrap();
        set_log("stderr:error,info,!trace:all,!mbedtls", true);
        assert!(!emit_log("trace", "app"));
        assert!(emit_log("info", "app"));
        assert!(!emit_log("info", "mbedtls"));
        assert!(!emit_log("error", "mbedtls"));
        assert!(emit_log("error", "app"));
        reset();
    }

    #[test]
    fn handler_receives_filtered_messages() {
        let _serial = SERIAL.lock().unwrap();
        static SEEN: StdMutex<Vec<(String, String, String)>> = StdMutex::new(Vec::new());
        SEEN.lock().unwrap().clear();
        set_log("none:error,info:all", true);
        set_log_handler(std::sync::Arc::new(|kind, source, message| {
            SEEN.lock()
                .unwrap()
                .push((kind.into(), source.into(), message.into()));
        }));

        rinfo!("handler-a", "hello {}", 7);
        rtrace!("handler-a", "dropped");
        rerror!("handler-b", "boom");

        // Other tests may log concurrently, so compare only our sources.
        let seen: Vec<_> = SEEN
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, source, _)| source.starts_with("handler-"))
            .cloned()
            .collect();
        assert_eq!(
            seen,
            vec![
                ("info".into(), "handler-a".into(), "hello 7".into()),
                ("error".into(), "handler-b".into(), "boom".into()),
            ]
        );
        reset();
    }

    #[test]
    fn template_tokens_render() {
        let mut probe = LogState::new();
        probe.format = "%A|%T|%S|%M|%x|%%".to_string();
        probe.app = "agent".into();
        let line = render(&probe, "info", "db", "msg");
        assert_eq!(line, "agent|info|db|msg|%x|%%");
    }

    #[test]
    fn file_destination_rotates() {
        let _serial = SERIAL.lock().unwrap();
        let path = temp_path("rotate");
        set_log(&format!("{}:all:all", path.display()), true);
        set_log_format("%M", true);
        set_log_limits(256, 2);

        let chunk = "x".repeat(63);
        for _ in 0..20 {
            rinfo!("app", "{}", chunk);
        }

        assert!(path.exists());
        let first = backup_path(&path, 1);
        let second = backup_path(&path, 2);
        assert!(first.exists());
        assert!(second.exists());
        assert!(!backup_path(&path, 3).exists());
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size <= 256);

        for stale in [&path, &first, &second] {
            let _ = std::fs::remove_file(stale);
        }
        reset();
    }

    #[test]
    fn raw_bypasses_template() {
        let _serial = SERIAL.lock().unwrap();
        let path = temp_path("raw");
        set_log(&format!("{}:all:all", path.display()), true);
        set_log_format("prefix %M", true);

        rlog!("raw", "app", "bare");
        rlog!("info", "app", "wrapped");

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("bare\n"));
        assert!(text.contains("prefix wrapped\n"));
        assert!(!text.contains("prefix bare"));

        let _ = std::fs::remove_file(&path);
        reset();
    }
}
