// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::time::Duration;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use strand::EventLoop;
use strand_http::{HttpManager, RequestOptions, SseEvent, SseReconnectConfig};
use tracing_subscriber::util::SubscriberInitExt;

const SSE_HEAD: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";

fn read_request(sock: &mut std::net::TcpStream) -> String {
    let mut raw = Vec::new();
    let mut buf = [0_u8; 1024];
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        match sock.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&raw).into_owned()
}

#[test]
fn events_parse_and_reconnect_carries_last_event_id() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .set_default();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{addr}/events");
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&requests);
    let server = std::thread::spawn(move || {
        // connection 1: three events, then the transport dies
        {
            let (mut sock, _) = listener.accept().unwrap();
            seen.lock().unwrap().push(read_request(&mut sock));
            sock.write_all(SSE_HEAD).unwrap();
            for i in 1..=3 {
                sock.write_all(format!("id: {i}\ndata: event-{i}\n\n").as_bytes())
                    .unwrap();
                sock.flush().unwrap();
            }
            // dropped here: the client must reconnect
        }
        // connection 2: one more event, then linger briefly
        {
            let (mut sock, _) = listener.accept().unwrap();
            seen.lock().unwrap().push(read_request(&mut sock));
            sock.write_all(SSE_HEAD).unwrap();
            sock.write_all(b"id: 4\ndata: event-4\n\n").unwrap();
            sock.flush().unwrap();
            std::thread::sleep(Duration::from_millis(200));
        }
    });

    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let manager = HttpManager::new(&h);

    let events: Rc<RefCell<Vec<SseEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let reconnects: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    let reconnect = SseReconnectConfig {
        max_attempts: 5,
        initial_delay: Duration::from_millis(20),
        jitter: false,
        on_reconnect: {
            let reconnects = Rc::clone(&reconnects);
            Some(Rc::new(move |attempt, _delay, _err| {
                reconnects.borrow_mut().push(attempt);
            }))
        },
        ..SseReconnectConfig::default()
    };

    let stream = {
        let events = Rc::clone(&events);
        el.block_on(manager.sse(
            &url,
            RequestOptions::get(),
            reconnect,
            move |_h, event| events.borrow_mut().push(event),
            |_h, err| panic!("sse terminal error: {err}"),
        ))
        .unwrap()
        .unwrap()
    };
    assert_eq!(stream.status(), 200);

    // drive the loop until the post-reconnect event lands
    let deadline = Instant::now() + Duration::from_secs(5);
    while events.borrow().len() < 4 {
        assert!(Instant::now() < deadline, "saw {:?}", events.borrow());
        el.block_on(h.delay(Duration::from_millis(25))).unwrap().unwrap();
    }

    stream.close();
    el.run_until_idle();

    let events = events.borrow();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0].data, "event-1");
    assert_eq!(events[2].id.as_deref(), Some("3"));
    assert_eq!(events[3].data, "event-4");

    assert_eq!(stream.last_event_id().as_deref(), Some("4"));
    assert!(
        reconnects.borrow().contains(&1),
        "on_reconnect must fire with the attempt counter"
    );

    let requests = requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(
        requests[0].contains("Accept: text/event-stream"),
        "sse headers missing: {}",
        requests[0]
    );
    assert!(!requests[0].contains("Last-Event-ID"));
    assert!(
        requests[1].contains("Last-Event-ID: 3"),
        "reconnect must resume from the last seen id: {}",
        requests[1]
    );
    drop(requests);
    server.join().unwrap();
}

#[test]
fn closing_the_handle_stops_reconnection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{addr}/events");

    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let _ = read_request(&mut sock);
        sock.write_all(SSE_HEAD).unwrap();
        sock.write_all(b"id: 1\ndata: only\n\n").unwrap();
        sock.flush().unwrap();
        // server goes away for good
    });

    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let manager = HttpManager::new(&h);
    let started = Instant::now();

    let events: Rc<RefCell<Vec<SseEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let stream = {
        let events = Rc::clone(&events);
        el.block_on(manager.sse(
            &url,
            RequestOptions::get(),
            SseReconnectConfig {
                initial_delay: Duration::from_millis(50),
                jitter: false,
                ..SseReconnectConfig::default()
            },
            move |_h, event| events.borrow_mut().push(event),
            |_h, _err| {},
        ))
        .unwrap()
        .unwrap()
    };

    while events.borrow().is_empty() {
        assert!(started.elapsed() < Duration::from_secs(5));
        el.block_on(h.delay(Duration::from_millis(20))).unwrap().unwrap();
    }

    stream.close();
    stream.close(); // idempotent
    el.run_until_idle();

    assert!(
        started.elapsed() < Duration::from_secs(3),
        "closing must cancel the pending reconnect timer"
    );
    assert_eq!(events.borrow().len(), 1);
    server.join().unwrap();
}
