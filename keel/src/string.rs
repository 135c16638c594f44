// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! String and value utilities.
//!
//! Number rendering goes through `core::fmt`; this module adds what the
//! standard formatter does not cover: radix conversion, digit grouping,
//! unit-suffixed value parsing and `${name}` template expansion.

use crate::error::{Error, Result};
use crate::map::Map;

/// Split on any character of `delims`, skipping empty tokens.
pub fn tokenize<'a>(s: &'a str, delims: &str) -> Vec<&'a str> {
    s.split(|c| delims.contains(c))
        .filter(|tok| !tok.is_empty())
        .collect()
}

/// Split on the literal `pattern`, keeping empty tokens.
pub fn split_pattern<'a>(s: &'a str, pattern: &str) -> Vec<&'a str> {
    if pattern.is_empty() {
        return vec![s];
    }
    s.split(pattern).collect()
}

/// Uppercase the first character.
#[must_use]
pub fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Lowercase the first character.
#[must_use]
pub fn camel_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// True for an optionally signed run of decimal digits.
#[must_use]
pub fn is_numeric(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// True for a `0x`-prefixed run of hex digits.
#[must_use]
pub fn is_hex_number(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

/// True for a decimal floating-point literal (digits with optional `.` and
/// exponent).
#[must_use]
pub fn is_float_number(s: &str) -> bool {
    if !s
        .bytes()
        .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
        return false;
    }
    s.parse::<f64>().is_ok()
}

/// Parse a signed integer with `0x`/`0o`/`0b` radix prefixes.
///
/// # Errors
///
/// [`Error::BadSyntax`] when the text is not a number in any supported
/// radix.
pub fn parse_int(s: &str) -> Result<i64> {
    let s = s.trim();
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (16, hex)
    } else if let Some(oct) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
        (8, oct)
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        (2, bin)
    } else {
        (10, body)
    };
    if digits.is_empty() {
        return Err(Error::BadSyntax);
    }
    let signed = if neg {
        let mut buf = String::with_capacity(digits.len() + 1);
        buf.push('-');
        buf.push_str(digits);
        i64::from_str_radix(&buf, radix)
    } else {
        i64::from_str_radix(digits, radix)
    };
    signed.map_err(|_| Error::BadSyntax)
}

/// Parse a decimal floating-point number.
///
/// # Errors
///
/// [`Error::BadSyntax`] when the text is not a float literal.
pub fn parse_double(s: &str) -> Result<f64> {
    s.trim().parse::<f64>().map_err(|_| Error::BadSyntax)
}

/// Parse a number with an optional unit suffix.
///
/// Size suffixes use binary multipliers (`k`, `m`, `g`); time suffixes
/// yield milliseconds (`sec`, `min`, `hr`, `day`, `week`, `month`, `year`);
/// `unlimited`, `infinite`, `never` and `forever` yield `i64::MAX`.
/// Multiplication saturates.
///
/// # Errors
///
/// [`Error::BadSyntax`] for an empty value, an unknown suffix or a
/// malformed number.
pub fn parse_value(s: &str) -> Result<i64> {
    let s = s.trim();
    match s.to_ascii_lowercase().as_str() {
        "unlimited" | "infinite" | "never" | "forever" => return Ok(i64::MAX),
        _ => {}
    }
    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '-' || *c == '+'))
        .map_or(s.len(), |(i, _)| i);
    let (digits, suffix) = s.split_at(split);
    let value = parse_int(digits)?;
    let multiplier: i64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "byte" | "bytes" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        "ms" | "msec" | "msecs" => 1,
        "sec" | "secs" | "second" | "seconds" => 1000,
        "min" | "mins" | "minute" | "minutes" => 60 * 1000,
        "hr" | "hrs" | "hour" | "hours" => 60 * 60 * 1000,
        "day" | "days" => 24 * 60 * 60 * 1000,
        "week" | "weeks" => 7 * 24 * 60 * 60 * 1000,
        "month" | "months" => 30 * 24 * 60 * 60 * 1000,
        "year" | "years" => 365 * 24 * 60 * 60 * 1000,
        _ => return Err(Error::BadSyntax),
    };
    Ok(value.saturating_mul(multiplier))
}

/// Expand `${name}` references against a name/value map. Unknown names
/// expand to nothing; a `$` not followed by `{` is copied verbatim.
#[must_use]
pub fn template(s: &str, values: &Map<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find("${") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 2..];
        match after.find('}') {
            Some(end) => {
                if let Some(value) = values.get(&after[..end]) {
                    out.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference, keep the literal text.
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render an integer in the given radix (2..=16), lowercase digits.
///
/// # Errors
///
/// [`Error::BadArgs`] for a radix outside 2..=16.
pub fn itosradix(value: i64, radix: u32) -> Result<String> {
    if !(2..=16).contains(&radix) {
        return Err(Error::BadArgs);
    }
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut buf = [0_u8; 64];
    let mut at = buf.len();
    loop {
        at -= 1;
        buf[at] = DIGITS[(magnitude % u64::from(radix)) as usize];
        magnitude /= u64::from(radix);
        if magnitude == 0 {
            break;
        }
    }
    let mut out = String::with_capacity(buf.len() - at + 1);
    if negative {
        out.push('-');
    }
    out.push_str(std::str::from_utf8(&buf[at..]).expect("ascii digits"));
    Ok(out)
}

/// Render an integer with comma digit grouping (`1,234,567`).
#[must_use]
pub fn format_grouped(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    let lead = digits.len() % 3;
    let mut first = true;
    if lead > 0 {
        out.push_str(&digits[..lead]);
        first = false;
    }
    let mut at = lead;
    while at < digits.len() {
        if !first {
            out.push(',');
        }
        out.push_str(&digits[at..at + 3]);
        first = false;
        at += 3;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_skips_empty() {
        assert_eq!(tokenize("a, b,,c", ", "), vec!["a", "b", "c"]);
        assert_eq!(tokenize("", ","), Vec::<&str>::new());
    }

    #[test]
    fn split_pattern_keeps_empty() {
        assert_eq!(split_pattern("a::b::", "::"), vec!["a", "b", ""]);
    }

    #[test]
    fn predicates() {
        assert!(is_numeric("-42"));
        assert!(!is_numeric("42x"));
        assert!(is_hex_number("0xdead"));
        assert!(!is_hex_number("dead"));
        assert!(is_float_number("1.5e3"));
        assert!(!is_float_number("1.5.3"));
    }

    #[test]
    fn parse_int_radices() {
        assert_eq!(parse_int("42"), Ok(42));
        assert_eq!(parse_int("-0x10"), Ok(-16));
        assert_eq!(parse_int("0b101"), Ok(5));
        assert_eq!(parse_int("0o17"), Ok(15));
        assert_eq!(parse_int("-9223372036854775808"), Ok(i64::MIN));
        assert_eq!(parse_int("nope"), Err(Error::BadSyntax));
    }

    // format -> parse is identity for any i64, including the minimum.
    #[test]
    fn int_format_parse_round_trip() {
        for n in [0, 1, -1, 42, i64::MAX, i64::MIN, i64::MIN + 1] {
            let text = format!("{n}");
            assert_eq!(parse_int(&text), Ok(n));
        }
    }

    #[test]
    fn parse_value_suffixes() {
        assert_eq!(parse_value("10k"), Ok(10 * 1024));
        assert_eq!(parse_value("2mb"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_value("30sec"), Ok(30_000));
        assert_eq!(parse_value("2min"), Ok(120_000));
        assert_eq!(parse_value("1day"), Ok(86_400_000));
        assert_eq!(parse_value("unlimited"), Ok(i64::MAX));
        assert_eq!(parse_value("forever"), Ok(i64::MAX));
        assert_eq!(parse_value("7"), Ok(7));
        assert_eq!(parse_value("7parsecs"), Err(Error::BadSyntax));
    }

    #[test]
    fn template_expansion() {
        let mut values = Map::new();
        values.insert("host", "example.com".to_string());
        values.insert("port", "8080".to_string());
        assert_eq!(
            template("http://${host}:${port}/${missing}x", &values),
            "http://example.com:8080/x"
        );
        assert_eq!(template("cost $5 ${", &values), "cost $5 ${");
    }

    #[test]
    fn radix_rendering() {
        assert_eq!(itosradix(255, 16).unwrap(), "ff");
        assert_eq!(itosradix(-255, 16).unwrap(), "-ff");
        assert_eq!(itosradix(5, 2).unwrap(), "101");
        assert_eq!(itosradix(i64::MIN, 16).unwrap(), "-8000000000000000");
        assert_eq!(itosradix(10, 17), Err(Error::BadArgs));
    }

    #[test]
    fn grouping() {
        assert_eq!(format_grouped(0), "0");
        assert_eq!(format_grouped(999), "999");
        assert_eq!(format_grouped(1_234_567), "1,234,567");
        assert_eq!(format_grouped(-1_000), "-1,000");
        assert_eq!(format_grouped(i64::MIN), "-9,223,372,036,854,775,808");
    }
}
