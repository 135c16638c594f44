// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Growable byte buffer with separate read and write positions.
//!
//! A `Buf` owns one contiguous region addressed by two cursors: `start`
//! (next byte to read) and `end` (next byte to write). The invariant
//! `0 <= start <= end <= size` holds across every operation. Protocol code
//! appends with the `put_*` family and consumes from the front with
//! `get_*`; `compact` reclaims consumed space.

use crate::error::{Error, Result};
use crate::mem;
use core::fmt;

const DEFAULT_SIZE: usize = 1024;

pub struct Buf {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl Buf {
    /// A buffer with the default initial region.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SIZE)
    }

    /// A buffer with an explicit initial region size.
    #[must_use]
    pub fn with_capacity(initial: usize) -> Self {
        let size = if initial == 0 { DEFAULT_SIZE } else { initial };
        Self {
            data: vec![0; size],
            start: 0,
            end: 0,
        }
    }

    /// Bytes available to read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes of unwritten space at the tail.
    #[must_use]
    pub fn space(&self) -> usize {
        self.data.len() - self.end
    }

    /// Total region size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Unread content.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Unread content viewed as UTF-8 without copying.
    ///
    /// # Errors
    ///
    /// [`Error::BadData`] when the content is not valid UTF-8.
    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()).map_err(|_| Error::BadData)
    }

    /// Consume the buffer, transferring the unread content out as a string.
    ///
    /// # Errors
    ///
    /// [`Error::BadData`] when the content is not valid UTF-8.
    pub fn into_string(mut self) -> Result<String> {
        self.data.truncate(self.end);
        self.data.drain(..self.start);
        String::from_utf8(self.data).map_err(|_| Error::BadData)
    }

    /// Append bytes, growing as needed.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put(&mut self, bytes: &[u8]) -> Result<usize> {
        self.reserve(bytes.len())?;
        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(bytes.len())
    }

    /// Append one character, UTF-8 encoded.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put_char(&mut self, c: char) -> Result<usize> {
        let mut utf8 = [0_u8; 4];
        self.put(c.encode_utf8(&mut utf8).as_bytes())
    }

    /// Append a string.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put_str(&mut self, s: &str) -> Result<usize> {
        self.put(s.as_bytes())
    }

    /// Append at most `max` bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put_sub(&mut self, bytes: &[u8], max: usize) -> Result<usize> {
        self.put(&bytes[..bytes.len().min(max)])
    }

    /// Append a decimal integer.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put_int(&mut self, value: i64) -> Result<usize> {
        self.put_fmt(format_args!("{value}"))
    }

    /// Append formatted text (see also the [`fmt::Write`] impl).
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn put_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize> {
        let before = self.len();
        fmt::Write::write_fmt(self, args).map_err(|_| Error::WontFit)?;
        Ok(self.len() - before)
    }

    /// Consume one byte from the front.
    pub fn get_char(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let c = self.data[self.start];
        self.start += 1;
        self.reset_if_empty();
        Some(c)
    }

    /// Consume up to `out.len()` bytes from the front, returning the count.
    pub fn get_block(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.data[self.start..self.start + n]);
        self.start += n;
        self.reset_if_empty();
        n
    }

    /// Peek at the next unread byte.
    #[must_use]
    pub fn look_at_next(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.data[self.start])
    }

    /// Peek at the last written byte.
    #[must_use]
    pub fn look_at_last(&self) -> Option<u8> {
        (!self.is_empty()).then(|| self.data[self.end - 1])
    }

    /// Move the read position by `delta`, clamped to `[0, len]`.
    pub fn adjust_start(&mut self, delta: i64) {
        let start = clamp_offset(self.start, delta, 0, self.end);
        self.start = start;
    }

    /// Move the write position by `delta`, clamped to `[start, size]`.
    /// Used with [`Self::space`] for zero-copy fills by backend reads.
    pub fn adjust_end(&mut self, delta: i64) {
        let end = clamp_offset(self.end, delta, self.start, self.data.len());
        self.end = end;
    }

    /// Writable tail of the region, for zero-copy fills. Pair with
    /// [`Self::adjust_end`].
    pub fn space_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.data[end..]
    }

    /// Move unread content to the base of the region.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        let len = self.len();
        self.data.copy_within(self.start..self.end, 0);
        self.start = 0;
        self.end = len;
    }

    /// Discard all content.
    pub fn flush(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Rewind both cursors when the buffer has no unread content.
    pub fn reset_if_empty(&mut self) {
        if self.is_empty() {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Ensure at least `need` bytes of tail space, growing if required.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn reserve(&mut self, need: usize) -> Result<()> {
        if self.space() >= need {
            return Ok(());
        }
        if self.start > 0 && self.len() + need <= self.data.len() {
            self.compact();
            return Ok(());
        }
        let mut size = self.data.len().max(1);
        while size - self.end < need {
            size = size
                .checked_mul(2)
                .ok_or(Error::WontFit)?
                .max(self.end + need);
        }
        mem::check_size(size)?;
        self.data.resize(size, 0);
        Ok(())
    }

    /// Grow the region by `by` bytes.
    ///
    /// # Errors
    ///
    /// [`Error::BadArgs`] for zero growth; [`Error::WontFit`] past the
    /// memory ceiling.
    pub fn grow(&mut self, by: usize) -> Result<()> {
        if by == 0 {
            return Err(Error::BadArgs);
        }
        let size = self.data.len().checked_add(by).ok_or(Error::WontFit)?;
        mem::check_size(size)?;
        self.data.resize(size, 0);
        Ok(())
    }

    /// Write a terminating NUL one past the content without advancing the
    /// write position.
    ///
    /// # Errors
    ///
    /// [`Error::WontFit`] when growth would exceed the memory ceiling.
    pub fn add_null(&mut self) -> Result<()> {
        self.reserve(1)?;
        self.data[self.end] = 0;
        Ok(())
    }
}

impl Default for Buf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for Buf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.put_str(s).map(|_| ()).map_err(|_| fmt::Error)
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("size", &self.size())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

fn clamp_offset(at: usize, delta: i64, low: usize, high: usize) -> usize {
    let shifted = i64::try_from(at).unwrap_or(i64::MAX).saturating_add(delta);
    let shifted = usize::try_from(shifted.max(0)).unwrap_or(0);
    shifted.clamp(low, high)
}
