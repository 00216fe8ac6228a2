// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Response header collection.
//!
//! Headers arrive one raw line at a time (`Name: value\r\n`) and are folded into
//! [`ResponseHeaders`], an ordered map whose keys compare case-insensitively.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Header name that keeps its original spelling but orders and compares ignoring ASCII case.
#[derive(Debug, Clone)]
struct HeaderKey(String);

impl Ord for HeaderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .bytes()
            .map(|b| b.to_ascii_lowercase())
            .cmp(other.0.bytes().map(|b| b.to_ascii_lowercase()))
    }
}

impl PartialOrd for HeaderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for HeaderKey {}

#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    entries: BTreeMap<HeaderKey, String>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing the value of any header with the same name.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(HeaderKey(key.into()), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&HeaderKey(key.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.0.as_str(), value.as_str()))
    }
}

/// Fold one raw header line into `headers` and return the number of bytes consumed.
///
/// The last two bytes are taken to be the CRLF terminator. The key runs up to the first colon
/// found at offset `1..len-2`, minus the spaces right before it; the value starts after the
/// spaces following the colon and stops at the terminator. Lines without such a colon (status
/// line, blank separator) are skipped. The whole buffer is always reported as consumed, since
/// a streaming transport aborts the transfer on a short count.
pub fn parse_header_line(buffer: &[u8], headers: &mut ResponseHeaders) -> usize {
    let size = buffer.len();
    let end = size.saturating_sub(2);

    let Some(colon) = (1..end).find(|&i| buffer[i] == b':') else {
        return size;
    };

    let key_padding = buffer[1..colon]
        .iter()
        .rev()
        .take_while(|&&b| b == b' ')
        .count();
    let value_padding = buffer[colon + 1..end]
        .iter()
        .take_while(|&&b| b == b' ')
        .count();

    let key = String::from_utf8_lossy(&buffer[..colon - key_padding]);
    let value = String::from_utf8_lossy(&buffer[colon + 1 + value_padding..end]);
    headers.insert(key, value);
    size
}
