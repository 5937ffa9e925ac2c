// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! In-process HTTP fixture server.
//!
//! Serves one scripted response per connection (`Connection: close`) and
//! records every raw request, so tests can assert on retry counts and
//! conditional headers without touching the network.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

pub struct FixtureServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<String>>>,
    worker: Option<JoinHandle<()>>,
}

/// Builds one raw HTTP/1.1 response.
pub fn response(status: u16, reason: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut raw = format!("HTTP/1.1 {status} {reason}\r\n");
    for (name, value) in headers {
        raw.push_str(&format!("{name}: {value}\r\n"));
    }
    raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    raw.push_str("Connection: close\r\n\r\n");
    let mut raw = raw.into_bytes();
    raw.extend_from_slice(body);
    raw
}

impl FixtureServer {
    /// Serves the scripted responses, one connection each, then exits.
    pub fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture server");
        let addr = listener.local_addr().expect("fixture server addr");
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&requests);
        let worker = std::thread::spawn(move || {
            for scripted in responses {
                let Ok((mut sock, _)) = listener.accept() else {
                    return;
                };
                sock.set_read_timeout(Some(Duration::from_secs(5))).ok();
                let request = read_request_head(&mut sock);
                seen.lock().expect("request log poisoned").push(request);
                let _ = sock.write_all(&scripted);
                let _ = sock.flush();
            }
        });

        Self {
            url: format!("http://{addr}/resource"),
            requests,
            worker: Some(worker),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("request log poisoned").len()
    }

    pub fn request(&self, index: usize) -> String {
        self.requests.lock().expect("request log poisoned")[index].clone()
    }

    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            worker.join().expect("fixture server panicked");
        }
    }
}

impl Drop for FixtureServer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Reads until the blank line ending the header block, then any body bytes
/// a `Content-Length` header announces.
fn read_request_head(sock: &mut std::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0_u8; 1024];
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        match sock.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }

    let head_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map_or(raw.len(), |at| at + 4);
    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();

    if let Some(length) = content_length(&head) {
        let mut body = raw[head_end..].to_vec();
        while body.len() < length {
            match sock.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        return format!("{head}{}", String::from_utf8_lossy(&body));
    }
    head
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        let value = lower.strip_prefix("content-length:")?.trim().to_string();
        value.parse().ok()
    })
}
