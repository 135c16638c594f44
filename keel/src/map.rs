// Copyright 2026. Keel Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Name/value map with stable entry slots.
//!
//! Entries live in a slot array with an embedded freelist; a hash index
//! maps the (optionally caseless) name to its slot. Iteration walks the
//! slot array, so it sees entries in insertion order as long as no removal
//! has recycled a slot. Mutation during iteration is rejected by the borrow
//! checker, which is the fail-fast the C-era "rehash during iteration"
//! hazard called for.

use bitflags::bitflags;
use std::fmt;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{Error, Result};

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct MapFlags: u32 {
        /// Compare names case-insensitively.
        const CASELESS = 1 << 0;
    }
}

struct Entry<V> {
    name: String,
    value: V,
}

pub struct Map<V> {
    entries: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    flags: MapFlags,
}

impl<V> Map<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_flags(MapFlags::empty())
    }

    #[must_use]
    pub fn with_flags(flags: MapFlags) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            flags,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn key(&self, name: &str) -> String {
        if self.flags.contains(MapFlags::CASELESS) {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }

    /// Insert or replace, returning the previous value if any.
    pub fn insert(&mut self, name: &str, value: V) -> Option<V> {
        let key = self.key(name);
        if let Some(&slot) = self.index.get(&key) {
            let entry = self.entries[slot].as_mut().expect("indexed slot occupied");
            return Some(core::mem::replace(&mut entry.value, value));
        }
        let entry = Entry {
            name: name.to_string(),
            value,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        self.index.insert(key, slot);
        None
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&V> {
        let slot = *self.index.get(&self.key(name))?;
        self.entries[slot].as_ref().map(|entry| &entry.value)
    }

    #[must_use]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        let slot = *self.index.get(&self.key(name))?;
        self.entries[slot].as_mut().map(|entry| &mut entry.value)
    }

    /// The stored (original-case) name and value.
    #[must_use]
    pub fn get_entry(&self, name: &str) -> Option<(&str, &V)> {
        let slot = *self.index.get(&self.key(name))?;
        self.entries[slot]
            .as_ref()
            .map(|entry| (entry.name.as_str(), &entry.value))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&self.key(name))
    }

    /// Remove an entry, vacating its slot for reuse.
    ///
    /// # Errors
    ///
    /// [`Error::CantFind`] when the name is absent.
    pub fn remove(&mut self, name: &str) -> Result<V> {
        let key = self.key(name);
        let slot = self.index.remove(&key).ok_or(Error::CantFind)?;
        let entry = self.entries[slot].take().expect("indexed slot occupied");
        self.free.push(slot);
        Ok(entry.value)
    }

    /// Entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries
            .iter()
            .filter_map(|slot| slot.as_ref().map(|entry| (entry.name.as_str(), &entry.value)))
    }
}

impl Map<String> {
    /// Insert the first `max` bytes of `value`.
    pub fn insert_substring(&mut self, name: &str, value: &str, max: usize) -> Option<String> {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .chain([value.len()])
            .take_while(|&i| i <= max)
            .last()
            .unwrap_or(0);
        self.insert(name, value[..end].to_string())
    }

    pub fn insert_int(&mut self, name: &str, value: i64) -> Option<String> {
        self.insert(name, value.to_string())
    }

    pub fn insert_fmt(&mut self, name: &str, args: fmt::Arguments<'_>) -> Option<String> {
        self.insert(name, fmt::format(args))
    }
}

impl<V: fmt::Display> Map<V> {
    /// Render `name=value` pairs joined by `sep`, in slot order.
    #[must_use]
    pub fn to_joined_string(&self, sep: &str) -> String {
        use fmt::Write as _;
        let mut out = String::new();
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                out.push_str(sep);
            }
            let _ = write!(out, "{name}={value}");
        }
        out
    }
}

impl<V: Serialize> Map<V> {
    /// Render as a JSON object, preserving slot order.
    ///
    /// # Errors
    ///
    /// [`Error::BadData`] when a value cannot be serialized.
    pub fn to_json(&self) -> Result<String> {
        self.render_json(false)
    }

    /// Render as an indented JSON object, preserving slot order.
    ///
    /// # Errors
    ///
    /// [`Error::BadData`] when a value cannot be serialized.
    pub fn to_json_pretty(&self) -> Result<String> {
        self.render_json(true)
    }

    fn render_json(&self, pretty: bool) -> Result<String> {
        let mut out = String::from("{");
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if pretty {
                out.push_str("\n    ");
            }
            let name = serde_json::to_string(name).map_err(|_| Error::BadData)?;
            out.push_str(&name);
            out.push(':');
            if pretty {
                out.push(' ');
            }
            let value = serde_json::to_string(value).map_err(|_| Error::BadData)?;
            out.push_str(&value);
        }
        if pretty && !self.is_empty() {
            out.push('\n');
        }
        out.push('}');
        Ok(out)
    }
}

impl<V: Clone> Clone for Map<V> {
    fn clone(&self) -> Self {
        let mut copy = Self::with_flags(self.flags);
        for (name, value) in self.iter() {
            copy.insert(name, value.clone());
        }
        copy
    }
}

impl<V> Default for Map<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for Map<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replace_remove() {
        let mut map = Map::new();
        assert_eq!(map.insert("a", 1), None);
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get("a"), Some(&2));
        assert_eq!(map.remove("a"), Ok(2));
        assert_eq!(map.remove("a"), Err(Error::CantFind));
        assert!(map.is_empty());
    }

    #[test]
    fn caseless_lookup_preserves_name() {
        let mut map = Map::with_flags(MapFlags::CASELESS);
        map.insert("Content-Type", "text/html".to_string());
        assert_eq!(map.get("content-type").map(String::as_str), Some("text/html"));
        assert_eq!(
            map.get_entry("CONTENT-TYPE").map(|(name, _)| name),
            Some("Content-Type")
        );
    }

    #[test]
    fn iteration_is_insertion_ordered() {
        let mut map = Map::new();
        for (i, name) in ["one", "two", "three"].iter().enumerate() {
            map.insert_int(name, i64::try_from(i).unwrap());
        }
        let names: Vec<&str> = map.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
    }

    #[test]
    fn slots_are_recycled() {
        let mut map = Map::new();
        map.insert("a", 1);
        map.insert("b", 2);
        map.remove("a").unwrap();
        map.insert("c", 3);
        // "c" reuses the vacated slot, so it now iterates first.
        let names: Vec<&str> = map.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn substring_and_fmt_inserts() {
        let mut map = Map::new();
        map.insert_substring("k", "abcdef", 3);
        assert_eq!(map.get("k").map(String::as_str), Some("abc"));
        map.insert_fmt("f", format_args!("{}-{}", 1, 2));
        assert_eq!(map.get("f").map(String::as_str), Some("1-2"));
    }

    // JSON round trip: rendered object parses back to the same pairs.
    #[test]
    fn json_round_trip() {
        let mut map = Map::new();
        map.insert("plain", "value".to_string());
        map.insert("quoted", "say \"hi\"".to_string());
        map.insert("unicode", "héllo".to_string());

        for text in [map.to_json().unwrap(), map.to_json_pretty().unwrap()] {
            let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            let object = parsed.as_object().unwrap();
            assert_eq!(object.len(), map.len());
            for (name, value) in map.iter() {
                assert_eq!(object[name].as_str(), Some(value.as_str()));
            }
        }
    }

    #[test]
    fn joined_rendering() {
        let mut map = Map::new();
        map.insert_int("x", 1);
        map.insert_int("y", 2);
        assert_eq!(map.to_joined_string(", "), "x=1, y=2");
    }
}
