// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::rc::Rc;
use std::time::Instant;

use strand::{Error, EventLoop, Handle, Job};
use tracing_subscriber::util::SubscriberInitExt;

#[test]
fn all_preserves_input_order_not_completion_order() {
    let _trace = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .set_default();

    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let started = Instant::now();

    let slow = h.delay(Duration::from_millis(50)).map(|_| "a");
    let fast = h.delay(Duration::from_millis(10)).map(|_| "b");

    let values = el
        .block_on(strand::all(&h, vec![slow.into(), fast.into()]))
        .unwrap()
        .unwrap();

    assert_eq!(values, vec!["a", "b"]);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(500),
        "expected ~50ms, got {elapsed:?}"
    );
}

#[test]
fn all_rejects_on_first_rejection() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let ok = h.delay(Duration::from_millis(50)).map(|_| 1_u32);
    let bad = h
        .delay(Duration::from_millis(5))
        .then(|h: &Handle, ()| h.rejected::<u32>(Error::Config("broken".into())));

    let result = el
        .block_on(strand::all(&h, vec![ok.into(), bad.into()]))
        .unwrap();
    assert_eq!(result, Err(Error::Config("broken".into())));
}

#[test]
fn race_settles_with_first_settlement_even_a_rejection() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let rejecting = h
        .delay(Duration::from_millis(1))
        .then(|h: &Handle, ()| h.rejected::<&str>(Error::Config("x".into())));
    let fulfilling = h.delay(Duration::from_millis(10)).map(|_| "y");

    let result = el
        .block_on(strand::race(&h, vec![rejecting.into(), fulfilling.into()]))
        .unwrap();
    assert_eq!(result, Err(Error::Config("x".into())));
}

#[test]
fn any_aggregates_rejections_in_input_order() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let e1 = h.rejected::<u32>(Error::Config("e1".into()));
    let e2 = h.rejected::<u32>(Error::Config("e2".into()));
    let result = el
        .block_on(strand::any(&h, vec![e1.into(), e2.into()]))
        .unwrap();
    assert_eq!(
        result,
        Err(Error::Aggregate(vec![
            Error::Config("e1".into()),
            Error::Config("e2".into()),
        ]))
    );
}

#[test]
fn any_fulfils_with_first_fulfilment() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let failing = h.rejected::<u32>(Error::Config("e1".into()));
    let winning = h.delay(Duration::from_millis(5)).map(|_| 42_u32);
    let result = el
        .block_on(strand::any(&h, vec![failing.into(), winning.into()]))
        .unwrap();
    assert_eq!(result, Ok(42));
}

#[test]
fn concurrent_bounds_in_flight_and_preserves_order() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let started = Instant::now();

    let jobs: Vec<Job<u32>> = (1..=4)
        .map(|i| {
            Job::lazy(move |h: &Handle| h.delay(Duration::from_millis(100)).map(move |_| i))
        })
        .collect();

    let values = el.block_on(strand::concurrent(&h, jobs, 2)).unwrap().unwrap();
    assert_eq!(values, vec![1, 2, 3, 4]);

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(450),
        "two waves of two 100ms jobs should take ~200ms, got {elapsed:?}"
    );
}

#[test]
fn concurrent_fails_fast_and_cancels_outstanding() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let started = Instant::now();

    let jobs: Vec<Job<u32>> = vec![
        Job::lazy(|h: &Handle| {
            h.delay(Duration::from_millis(5))
                .then(|h: &Handle, ()| h.rejected::<u32>(Error::Config("boom".into())))
        }),
        // would keep the loop alive for a second if its timer survived
        Job::lazy(|h: &Handle| h.delay(Duration::from_secs(1)).map(|_| 2)),
        Job::lazy(|h: &Handle| h.delay(Duration::from_secs(1)).map(|_| 3)),
    ];

    let result = el.block_on(strand::concurrent(&h, jobs, 3)).unwrap();
    assert_eq!(result, Err(Error::Config("boom".into())));

    // outstanding cancellables were cancelled, so the loop drains promptly
    el.run_until_idle();
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "cancelled delays must not keep the loop alive"
    );
}

#[test]
fn batch_concatenates_results_in_input_order() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let jobs: Vec<Job<u32>> = (1..=5)
        .map(|i| Job::lazy(move |h: &Handle| h.delay(Duration::from_millis(5)).map(move |_| i)))
        .collect();
    let values = el
        .block_on(strand::batch(&h, jobs, 2, None))
        .unwrap()
        .unwrap();
    assert_eq!(values, vec![1, 2, 3, 4, 5]);
}

#[test]
fn timeout_rejects_and_cancels_the_underlying_delay() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let started = Instant::now();

    let slow = h.delay(Duration::from_secs(1));
    let result = el
        .block_on(strand::timeout(&h, slow, Duration::from_millis(10)))
        .unwrap();
    assert_eq!(result, Err(Error::Timeout(Duration::from_millis(10))));

    // the delay's timer must be gone, otherwise this would wait a second
    el.run_until_idle();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn timeout_passes_through_a_fast_settlement() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let fast = h.delay(Duration::from_millis(5)).map(|_| "done");
    let result = el
        .block_on(strand::timeout(&h, fast, Duration::from_secs(5)))
        .unwrap();
    assert_eq!(result, Ok("done"));
}

#[test]
fn promise_settles_at_most_once() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let (promise, settler) = h.promise::<u32>();
    settler.fulfil(1);
    settler.fulfil(2);
    settler.reject(Error::Cancelled);

    assert_eq!(promise.peek(), Some(Ok(1)));
}

#[test]
fn continuations_fire_in_fifo_order_as_microtasks() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let (promise, settler) = h.promise::<()>();

    for i in 1..=3 {
        let order = Rc::clone(&order);
        promise.subscribe(move |_h, _| order.borrow_mut().push(i));
    }
    settler.fulfil(());
    assert!(
        order.borrow().is_empty(),
        "continuations must not run synchronously with settlement"
    );

    // late registration still runs, on the next tick
    {
        let order = Rc::clone(&order);
        promise.subscribe(move |_h, _| order.borrow_mut().push(4));
    }
    el.run_until_idle();
    assert_eq!(&*order.borrow(), &[1, 2, 3, 4]);
}

#[test]
fn cancellation_is_idempotent_and_reaches_the_root_through_chains() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let cancels = Rc::new(Cell::new(0_u32));
    let (promise, _settler, cancel) = h.cancellable::<u32>();
    {
        let cancels = Rc::clone(&cancels);
        cancel.on_cancel(move |_h| cancels.set(cancels.get() + 1));
    }

    let derived = promise.map(|v| v * 2).finally(|| {});
    assert!(derived.cancel(), "derived chain must reach the root");
    cancel.cancel();
    cancel.cancel();

    assert_eq!(cancels.get(), 1, "cancel handler runs exactly once");
    assert_eq!(promise.peek(), Some(Err(Error::Cancelled)));

    el.run_until_idle();
    assert_eq!(derived.peek(), Some(Err(Error::Cancelled)));
}

#[test]
fn handler_panics_reject_the_derived_promise() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let mapped = h.resolved(1_u32).map(|_| -> u32 { panic!("handler exploded") });
    let result = el.block_on(mapped).unwrap();
    assert_eq!(result, Err(Error::Panicked("handler exploded".into())));
}

#[test]
fn finally_observes_both_branches_without_changing_them() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let ran = Rc::new(Cell::new(0_u32));
    let on_ok = {
        let ran = Rc::clone(&ran);
        h.resolved(7_u32).finally(move || ran.set(ran.get() + 1))
    };
    let on_err = {
        let ran = Rc::clone(&ran);
        h.rejected::<u32>(Error::Config("e".into()))
            .finally(move || ran.set(ran.get() + 1))
    };

    assert_eq!(el.block_on(on_ok).unwrap(), Ok(7));
    assert_eq!(
        el.block_on(on_err).unwrap(),
        Err(Error::Config("e".into()))
    );
    assert_eq!(ran.get(), 2);
}

#[test]
fn or_else_recovers_a_rejection() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let recovered = h
        .rejected::<u32>(Error::Config("transient".into()))
        .or_else(|h: &Handle, _err| h.resolved(9_u32));
    assert_eq!(el.block_on(recovered).unwrap(), Ok(9));
}
