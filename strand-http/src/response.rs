// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Response types.

use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;

use strand::{Error, Result};

/// A completed HTTP response. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Protocol version from the status line, e.g. `"1.1"` or `"2"`.
    pub version: String,
}

impl Response {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.clone())
            .map_err(|err| Error::Stream(format!("response body is not utf-8: {err}")))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|err| Error::Stream(format!("response body is not valid json: {err}")))
    }
}

/// Resolution of a streaming request: the response metadata plus the
/// in-memory buffer the chunks were accumulated into (chunks were also
/// delivered incrementally through the `on_chunk` callback).
#[derive(Debug, Clone)]
pub struct StreamingResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub version: String,
    buffer: Rc<Vec<u8>>,
}

impl StreamingResponse {
    pub(crate) fn new(response: Response) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            version: response.version,
            buffer: Rc::new(response.body),
        }
    }

    /// The full buffered body.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8((*self.buffer).clone())
            .map_err(|err| Error::Stream(format!("stream body is not utf-8: {err}")))
    }
}

/// Splits raw header lines into the parsed map plus the protocol version,
/// keeping the values of the final header block (after redirects).
pub(crate) fn parse_header_lines(lines: &[String]) -> (HashMap<String, String>, String) {
    let mut headers = HashMap::new();
    let mut version = String::new();

    for line in lines {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("HTTP/") {
            // a new status line starts the final block; earlier redirect
            // blocks are discarded
            headers.clear();
            version = rest.split_whitespace().next().unwrap_or("").to_string();
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    (headers, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing_keeps_final_block() {
        let lines = vec![
            "HTTP/1.1 301 Moved Permanently\r\n".to_string(),
            "Location: /next\r\n".to_string(),
            "\r\n".to_string(),
            "HTTP/1.1 200 OK\r\n".to_string(),
            "Content-Type: text/plain\r\n".to_string(),
            "ETag: \"abc\"\r\n".to_string(),
            "\r\n".to_string(),
        ];
        let (headers, version) = parse_header_lines(&lines);
        assert_eq!(version, "1.1");
        assert_eq!(headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(headers.get("etag").map(String::as_str), Some("\"abc\""));
        assert!(!headers.contains_key("location"));
    }

    #[test]
    fn response_accessors() {
        let response = Response {
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: br#"{"n": 3}"#.to_vec(),
            version: "2".into(),
        };
        assert!(response.ok());
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        let parsed: serde_json::Value = response.json().unwrap();
        assert_eq!(parsed["n"], 3);
    }
}
