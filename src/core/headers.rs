//! Typed, case-insensitive request header map.
//!
//! The bypass detector reasons about specific client-IP headers; a typed
//! map with explicit accessors keeps that logic out of raw string-keyed
//! lookups scattered across call sites.

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    entries: HashMap<String, String>,
}

impl RequestHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.entries
            .insert(name.to_ascii_lowercase(), value.trim().to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// First hop of the `X-Forwarded-For` chain, i.e. the claimed client.
    pub fn forwarded_for(&self) -> Option<&str> {
        self.get("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn real_ip(&self) -> Option<&str> {
        self.get("x-real-ip").filter(|v| !v.is_empty())
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.get("x-client-ip").filter(|v| !v.is_empty())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.get("user-agent").filter(|v| !v.is_empty())
    }
}

impl<S: AsRef<str>> FromIterator<(S, S)> for RequestHeaders {
    fn from_iter<T: IntoIterator<Item = (S, S)>>(iter: T) -> Self {
        let mut headers = RequestHeaders::new();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value.as_ref());
        }
        headers
    }
}
