// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Request configuration records with enumerated keys.

use core::time::Duration;
use std::path::PathBuf;

use serde::Serialize;

use crate::cache::CacheConfig;
use crate::retry::RetryConfig;
use strand::{Error, Result};

/// HTTP request method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Custom(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Custom(name) => name,
        }
    }
}

/// Authentication shorthand applied to the request.
#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Preferred HTTP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersionPref {
    V10,
    V11,
    V2,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks4,
    Socks5,
}

/// Proxy configuration: a plain URL or the detailed record.
#[derive(Debug, Clone)]
pub enum ProxyConfig {
    Url(String),
    Detailed {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        kind: ProxyKind,
    },
}

impl ProxyConfig {
    /// The proxy URL libcurl understands.
    pub(crate) fn to_proxy_url(&self) -> String {
        match self {
            ProxyConfig::Url(url) => url.clone(),
            ProxyConfig::Detailed {
                host, port, kind, ..
            } => {
                let scheme = match kind {
                    ProxyKind::Http => "http",
                    ProxyKind::Socks4 => "socks4",
                    ProxyKind::Socks5 => "socks5",
                };
                format!("{scheme}://{host}:{port}")
            }
        }
    }

    pub(crate) fn credentials(&self) -> Option<(String, Option<String>)> {
        match self {
            ProxyConfig::Url(_) => None,
            ProxyConfig::Detailed {
                username, password, ..
            } => username
                .as_ref()
                .map(|user| (user.clone(), password.clone())),
        }
    }
}

/// The enumerated per-request options.
///
/// Chunk/event callbacks are parameters of the streaming entry points
/// rather than fields here, so the record stays `Clone` across retries.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// JSON body; wins over `body` and sets `Content-Type: application/json`.
    pub json: Option<serde_json::Value>,
    /// URL-encoded form body; sets the form content type.
    pub form: Option<Vec<(String, String)>>,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub max_redirects: Option<u32>,
    pub verify_ssl: bool,
    pub user_agent: Option<String>,
    pub auth: Option<Auth>,
    pub http_version: Option<HttpVersionPref>,
    pub proxy: Option<ProxyConfig>,
    pub retry: Option<RetryConfig>,
    pub cache: Option<CacheConfig>,
    /// Deliver chunks as they arrive instead of only the buffered body.
    pub stream: bool,
    /// Write the body straight to this file; removed on failure/cancel.
    pub save_to: Option<PathBuf>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::Get,
            headers: Vec::new(),
            body: None,
            json: None,
            form: None,
            timeout: None,
            connect_timeout: None,
            follow_redirects: true,
            max_redirects: Some(10),
            verify_ssl: true,
            user_agent: None,
            auth: None,
            http_version: None,
            proxy: None,
            retry: None,
            cache: None,
            stream: false,
            save_to: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post() -> Self {
        Self {
            method: Method::Post,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` as the JSON body.
    pub fn with_json(mut self, value: &impl Serialize) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|err| Error::Config(format!("unserializable json body: {err}")))?;
        self.json = Some(value);
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The effective body bytes plus an implied content type, if any.
    pub(crate) fn encoded_body(&self) -> Result<Option<(Vec<u8>, Option<&'static str>)>> {
        if let Some(json) = &self.json {
            let body = serde_json::to_vec(json)
                .map_err(|err| Error::Config(format!("json body: {err}")))?;
            return Ok(Some((body, Some("application/json"))));
        }
        if let Some(form) = &self.form {
            let mut encoded = url::form_urlencoded::Serializer::new(String::new());
            for (name, value) in form {
                encoded.append_pair(name, value);
            }
            return Ok(Some((
                encoded.finish().into_bytes(),
                Some("application/x-www-form-urlencoded"),
            )));
        }
        Ok(self.body.clone().map(|body| (body, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_body_wins_and_sets_content_type() {
        let options = RequestOptions::post()
            .with_body("ignored")
            .with_json(&serde_json::json!({"a": 1}))
            .unwrap();
        let (body, content_type) = options.encoded_body().unwrap().unwrap();
        assert_eq!(body, br#"{"a":1}"#);
        assert_eq!(content_type, Some("application/json"));
    }

    #[test]
    fn form_body_is_url_encoded() {
        let mut options = RequestOptions::post();
        options.form = Some(vec![("q".into(), "a b".into()), ("x".into(), "1".into())]);
        let (body, content_type) = options.encoded_body().unwrap().unwrap();
        assert_eq!(body, b"q=a+b&x=1");
        assert_eq!(content_type, Some("application/x-www-form-urlencoded"));
    }

    #[test]
    fn detailed_proxy_builds_url() {
        let proxy = ProxyConfig::Detailed {
            host: "proxy.local".into(),
            port: 1080,
            username: Some("u".into()),
            password: Some("p".into()),
            kind: ProxyKind::Socks5,
        };
        assert_eq!(proxy.to_proxy_url(), "socks5://proxy.local:1080");
        assert_eq!(proxy.credentials(), Some(("u".into(), Some("p".into()))));
    }
}
