// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! GET-response caching.
//!
//! Entries are keyed by `sha1(url)` and store `{body, status, headers,
//! expires_at}`. A fresh entry is served without a network call; a stale
//! one is revalidated with `If-None-Match`/`If-Modified-Since` when server
//! headers are respected, and a `304` refreshes the entry instead of
//! refetching the body. Expiry honours `Cache-Control: max-age=N` when
//! enabled, falling back to the configured TTL.

use core::cell::{Cell, RefCell};
use core::fmt;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::response::Response;

/// A stored response value.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Unix seconds after which the entry is stale.
    pub expires_at: u64,
}

/// The injected cache store.
pub trait CacheBackend {
    fn get(&self, key: &str) -> Option<CachedResponse>;
    fn put(&self, key: &str, value: CachedResponse);
    fn remove(&self, key: &str);
}

/// Cache behaviour knobs.
#[derive(Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    /// Derive expiry from `Cache-Control: max-age` and revalidate stale
    /// entries with conditional headers.
    pub respect_server_headers: bool,
    /// Backend override; the manager's shared in-memory cache otherwise.
    pub backend: Option<Rc<dyn CacheBackend>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            respect_server_headers: true,
            backend: None,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            ttl_seconds,
            ..Self::default()
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("respect_server_headers", &self.respect_server_headers)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

/// `sha1(url)`, hex-encoded.
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Expiry for a response: `max-age` when server headers are respected,
/// else the configured TTL.
pub(crate) fn expires_at(config: &CacheConfig, response: &Response) -> u64 {
    let ttl = if config.respect_server_headers {
        response
            .header("cache-control")
            .and_then(parse_max_age)
            .unwrap_or(config.ttl_seconds)
    } else {
        config.ttl_seconds
    };
    unix_now() + ttl
}

/// A response is cacheable when 2xx and not explicitly forbidden.
pub(crate) fn is_cacheable(config: &CacheConfig, response: &Response) -> bool {
    if !response.ok() {
        return false;
    }
    if config.respect_server_headers
        && let Some(cache_control) = response.header("cache-control")
    {
        let lowered = cache_control.to_ascii_lowercase();
        if lowered.contains("no-store") || lowered.contains("no-cache") {
            return false;
        }
    }
    true
}

fn parse_max_age(cache_control: &str) -> Option<u64> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|value| value.parse().ok())
}

/// The default in-memory backend, with hit/miss counters.
pub struct MemoryCache {
    entries: RefCell<HashMap<String, CachedResponse>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemoryCache {
    fn get(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.entries.borrow().get(key).cloned();
        match &entry {
            Some(_) => self.hits.set(self.hits.get() + 1),
            None => self.misses.set(self.misses.get() + 1),
        }
        entry
    }

    fn put(&self, key: &str, value: CachedResponse) {
        self.entries.borrow_mut().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.borrow_mut().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> Response {
        Response {
            status,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: b"payload".to_vec(),
            version: "1.1".into(),
        }
    }

    #[test]
    fn key_is_sha1_of_url() {
        // sha1("http://example.com/")
        assert_eq!(
            cache_key("http://example.com/"),
            "9c17e047f58f9220a7008d4f18152fee4d111d14"
        );
    }

    #[test]
    fn max_age_wins_over_ttl_when_respected() {
        let config = CacheConfig::with_ttl(1000);
        let response = response(200, &[("cache-control", "public, max-age=60")]);
        let expires = expires_at(&config, &response);
        let delta = expires - unix_now();
        assert!((59..=61).contains(&delta), "expiry {delta}s should be ~60s");
    }

    #[test]
    fn ttl_used_when_server_headers_ignored() {
        let config = CacheConfig {
            ttl_seconds: 120,
            respect_server_headers: false,
            backend: None,
        };
        let response = response(200, &[("cache-control", "max-age=5")]);
        let delta = expires_at(&config, &response) - unix_now();
        assert!((119..=121).contains(&delta));
    }

    #[test]
    fn no_store_is_not_cacheable() {
        let config = CacheConfig::default();
        assert!(!is_cacheable(&config, &response(200, &[("cache-control", "no-store")])));
        assert!(!is_cacheable(&config, &response(404, &[])));
        assert!(is_cacheable(&config, &response(200, &[])));
    }

    #[test]
    fn memory_cache_counts_hits_and_misses() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").is_none());
        cache.put(
            "k",
            CachedResponse {
                body: Vec::new(),
                status: 200,
                headers: HashMap::new(),
                expires_at: unix_now() + 60,
            },
        );
        assert!(cache.get("k").is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
