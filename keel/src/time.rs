// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Clocks and calendar time.
//!
//! All runtime deadlines are expressed on the tick clock: monotonic
//! milliseconds since process start, immune to wall-clock skew. A deadline
//! of `0` means "no deadline". Calendar rendering and ISO-8601 parsing go
//! through `chrono`.

mod sleep;
mod timeout;
pub(crate) mod timer;

pub use sleep::{Sleep, sleep, sleep_until};
pub use timeout::{Timeout, timeout};

use crate::error::{Error, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic milliseconds. Absolute deadlines are values of this clock;
/// `0` means no deadline.
pub type Ticks = i64;

/// RFC-822 style rendering, the default when no format is given.
const DEFAULT_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic milliseconds since process start. Never decreases.
#[must_use]
pub fn ticks() -> Ticks {
    i64::try_from(epoch().elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Highest-resolution monotonic counter, in nanoseconds.
#[must_use]
pub fn hires_ticks() -> i64 {
    i64::try_from(epoch().elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn time() -> i64 {
    Utc::now().timestamp_millis()
}

/// Ticks elapsed since `mark`.
#[must_use]
pub fn elapsed(mark: Ticks) -> Ticks {
    (ticks() - mark).max(0)
}

/// Ticks left of `timeout` measured from `mark`, clamped to
/// `[0, timeout]`.
#[must_use]
pub fn remaining(mark: Ticks, timeout: Ticks) -> Ticks {
    (timeout - elapsed(mark)).clamp(0, timeout.max(0))
}

fn datetime(wall_ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(wall_ms).ok_or(Error::BadValue)
}

fn render<Tz>(when: DateTime<Tz>, fmt: Option<&str>) -> Result<String>
where
    Tz: TimeZone,
    Tz::Offset: core::fmt::Display,
{
    let fmt = fmt.unwrap_or(DEFAULT_FORMAT);
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(Error::BadFormat);
    }
    Ok(when.format_with_items(items.into_iter()).to_string())
}

/// Render a wall-clock millisecond time in the local zone. `None` selects
/// the RFC-822-style default format.
///
/// # Errors
///
/// [`Error::BadValue`] for an unrepresentable time, [`Error::BadFormat`]
/// for an invalid format string.
pub fn format_local_time(fmt: Option<&str>, wall_ms: i64) -> Result<String> {
    render(datetime(wall_ms)?.with_timezone(&Local), fmt)
}

/// Render a wall-clock millisecond time in UTC. `None` selects the
/// RFC-822-style default format.
///
/// # Errors
///
/// [`Error::BadValue`] for an unrepresentable time, [`Error::BadFormat`]
/// for an invalid format string.
pub fn format_universal_time(fmt: Option<&str>, wall_ms: i64) -> Result<String> {
    render(datetime(wall_ms)?, fmt)
}

/// Render the current local time.
///
/// # Errors
///
/// [`Error::BadFormat`] for an invalid format string.
pub fn get_date(fmt: Option<&str>) -> Result<String> {
    render(Local::now(), fmt)
}

/// ISO-8601/RFC-3339 with millisecond precision, UTC.
///
/// # Errors
///
/// [`Error::BadValue`] for an unrepresentable time.
pub fn get_iso_date(wall_ms: i64) -> Result<String> {
    Ok(datetime(wall_ms)?.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse an ISO-8601/RFC-3339 date back to wall-clock milliseconds.
///
/// # Errors
///
/// [`Error::BadFormat`] when the text does not parse.
pub fn parse_iso_date(s: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(s)
        .map(|when| when.timestamp_millis())
        .map_err(|_| Error::BadFormat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
        assert!(hires_ticks() >= a.saturating_mul(1_000_000) - 1_000_000);
    }

    #[test]
    fn remaining_clamps() {
        let mark = ticks();
        assert_eq!(remaining(mark + 1000, 50), 50);
        assert_eq!(remaining(mark - 1000, 50), 0);
        let left = remaining(mark, 10_000);
        assert!((0..=10_000).contains(&left));
    }

    // parse(render(t)) == t for any representable millisecond time.
    #[test]
    fn iso_round_trip() {
        for t in [0, 1, 999, 1_700_000_000_123, -1, time()] {
            let text = get_iso_date(t).unwrap();
            assert_eq!(parse_iso_date(&text), Ok(t), "{text}");
        }
    }

    #[test]
    fn formats() {
        let t = 1_700_000_000_000; // 2023-11-14T22:13:20Z
        assert_eq!(
            format_universal_time(Some("%Y-%m-%d %H:%M:%S"), t).unwrap(),
            "2023-11-14 22:13:20"
        );
        assert_eq!(format_universal_time(Some("%F"), t).unwrap(), "2023-11-14");
        assert_eq!(format_universal_time(Some("%T"), t).unwrap(), "22:13:20");
        assert_eq!(format_universal_time(Some("%R"), t).unwrap(), "22:13");
        assert_eq!(format_universal_time(Some("%v"), t).unwrap(), "14-Nov-2023");
        assert_eq!(format_universal_time(Some("%D"), t).unwrap(), "11/14/23");
        // Default is the RFC-822 style.
        assert_eq!(
            format_universal_time(None, t).unwrap(),
            "Tue, 14 Nov 2023 22:13:20 +0000"
        );
        assert_eq!(
            format_universal_time(Some("%!bogus"), t),
            Err(Error::BadFormat)
        );
        assert!(format_local_time(Some("%T"), t).is_ok());
        assert!(get_date(None).is_ok());
    }
}
