//! Attribute Map
//!
//! Case-insensitive metadata that travels with every submission and every
//! container entry.
//!
//! ## Rules
//! - Keys are trimmed and compared lower-cased; the spelling of the most recent
//!   insert is kept for output.
//! - Values are trimmed and line breaks in them become spaces.
//! - Keys containing `:` or a line break cannot be written as text and are
//!   ignored.
//! - Date keys (`EffectiveTime`, `ReceivedTime`) are rewritten to
//!   `yyyy-MM-ddTHH:mm:ss.SSSZ` when the value parses as a date. Unparsable
//!   values are kept as sent.
//! - Multi-valued attributes are a single string joined with `,`. `append_item`
//!   adds to the list instead of replacing it.
//!
//! ## Text form
//! A map serializes to one `key:value` line per attribute, ordered by key. This is
//! the content of `.meta` members and staged `.meta` files.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use tracing::debug;

use crate::headers;

/// Separator for multi-valued attributes.
pub const VALUE_DELIMITER: char = ',';

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attribute {
    key: String,
    value: String,
}

/// Case-insensitive string map with date and list normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    /// Lower-cased key -> original key and value
    entries: BTreeMap<String, Attribute>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a value, returning the previous one.
    ///
    /// Empty keys and keys that cannot be written as a `key:value` line are
    /// ignored.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Option<String> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return None;
        }
        if key.contains([':', '\r', '\n']) {
            debug!(key, "Ignoring attribute key that cannot be written as text");
            return None;
        }

        let mut value = value.as_ref().replace(['\r', '\n'], " ").trim().to_string();
        if headers::is_date_key(key) {
            value = normalise_date(&value);
        }

        self.entries
            .insert(
                key.to_lowercase(),
                Attribute {
                    key: key.to_string(),
                    value,
                },
            )
            .map(|previous| previous.value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.trim().to_lowercase())
            .map(|a| a.value.as_str())
    }

    /// Value for `key` when present and not blank.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.trim().to_lowercase())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries
            .remove(&key.trim().to_lowercase())
            .map(|a| a.value)
    }

    /// Iterate `(key, value)` pairs ordered by lower-cased key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|a| (a.key.as_str(), a.value.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|a| a.key.as_str())
    }

    /// Add `item` to the delimited list held by `key`.
    ///
    /// Items already in the list are not added twice.
    pub fn append_item(&mut self, key: &str, item: &str) {
        let item = item.trim();
        if item.is_empty() {
            return;
        }
        match self.get_non_empty(key) {
            None => {
                self.insert(key, item);
            }
            Some(existing) => {
                if split_list(existing).any(|v| v == item) {
                    return;
                }
                let joined = format!("{}{}{}", existing, VALUE_DELIMITER, item);
                self.insert(key, joined);
            }
        }
    }

    pub fn append_date_time(&mut self, key: &str, time: DateTime<Utc>) {
        self.append_item(key, &format_date(time));
    }

    pub fn put_date_time(&mut self, key: &str, time: DateTime<Utc>) {
        self.insert(key, format_date(time));
    }

    pub fn put_current_date_time(&mut self, key: &str) {
        self.put_date_time(key, Utc::now());
    }

    /// Store `values` as a single delimited list, replacing any previous value.
    pub fn put_collection<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = values
            .into_iter()
            .map(|v| v.as_ref().trim().to_string())
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(&VALUE_DELIMITER.to_string());
        self.insert(key, joined);
    }

    /// Split the value for `key` into its list items.
    pub fn get_as_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| split_list(v).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn get_date_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(parse_date)
    }

    /// Copy every attribute of `other` into this map.
    ///
    /// When `overwrite` is false, keys already present here keep their value.
    pub fn merge_from(&mut self, other: &AttributeMap, overwrite: bool) {
        for (key, value) in other.iter() {
            if overwrite || !self.contains_key(key) {
                self.insert(key, value);
            }
        }
    }

    /// Keep only attributes that have the same value in `other`.
    pub fn retain_common(&mut self, other: &AttributeMap) {
        self.entries.retain(|lower, attr| {
            other
                .entries
                .get(lower)
                .map(|o| o.value == attr.value)
                .unwrap_or(false)
        });
    }

    /// Parse the `key:value` text form.
    ///
    /// Blank lines are skipped, a line without `:` becomes a key with an empty value.
    pub fn parse_meta(text: &str) -> Self {
        let mut map = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((key, value)) => map.insert(key, value),
                None => map.insert(line, ""),
            };
        }
        map
    }

    pub fn from_meta_bytes(bytes: &[u8]) -> Self {
        Self::parse_meta(&String::from_utf8_lossy(bytes))
    }

    pub fn write_meta<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for (key, value) in self.iter() {
            writeln!(writer, "{}:{}", key, value)?;
        }
        Ok(())
    }

    pub fn to_meta_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for AttributeMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{}:{}", key, value)?;
        }
        Ok(())
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for AttributeMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::new();
        map.extend(iter);
        map
    }
}

impl<K: AsRef<str>, V: AsRef<str>> Extend<(K, V)> for AttributeMap {
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        for (k, v) in iter {
            self.insert(k, v);
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(VALUE_DELIMITER)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Canonical date form, e.g. `2024-01-02T03:04:05.678Z`.
pub fn format_date(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339, zone-less ISO-8601 (UTC assumed) or epoch milliseconds.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, pattern) {
            return Some(naive.and_utc());
        }
    }
    if value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
    }
    None
}

fn normalise_date(value: &str) -> String {
    match parse_date(value) {
        Some(dt) => format_date(dt),
        None => value.to_string(),
    }
}
