// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::cell::RefCell;
use core::time::Duration;
use std::rc::Rc;
use std::time::Instant;

use strand::{Error, EventLoop, Handle};

#[test]
fn next_tick_runs_in_submission_order_before_timers() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let order = Rc::clone(&order);
        h.add_timer(Duration::ZERO, move |_h| order.borrow_mut().push("timer"));
    }
    for label in ["tick-1", "tick-2"] {
        let order = Rc::clone(&order);
        h.next_tick(move |_h| order.borrow_mut().push(label));
    }
    {
        let order = Rc::clone(&order);
        h.defer(move |_h| order.borrow_mut().push("deferred"));
    }

    el.run_until_idle();
    assert_eq!(&*order.borrow(), &["tick-1", "tick-2", "timer", "deferred"]);
}

#[test]
fn timers_fire_in_deadline_order_with_ties_by_insertion() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let record = |n: u32| {
        let order = Rc::clone(&order);
        move |_h: &Handle| order.borrow_mut().push(n)
    };
    h.add_timer(Duration::from_millis(20), record(3));
    h.add_timer(Duration::from_millis(5), record(1));
    h.add_timer(Duration::from_millis(5), record(2));

    el.run_until_idle();
    assert_eq!(&*order.borrow(), &[1, 2, 3]);
}

#[test]
fn interval_repeats_until_cancelled() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let fired = Rc::new(RefCell::new(0_u32));
    let id = {
        let fired = Rc::clone(&fired);
        h.interval(Duration::from_millis(5), move |h| {
            let mut fired = fired.borrow_mut();
            *fired += 1;
            if *fired == 3 {
                h.stop();
            }
        })
    };

    el.run_until_idle();
    assert_eq!(*fired.borrow(), 3);
    assert!(h.cancel_timer(id), "interval is still armed after stop");
}

#[test]
fn stop_exits_with_outstanding_work() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let started = Instant::now();

    h.add_timer(Duration::from_secs(60), |_h| {});
    h.next_tick(|h: &Handle| h.stop());

    el.run_until_idle();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn block_on_reports_stop_as_cancelled() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let (promise, _settler) = h.promise::<u32>();
    h.add_timer(Duration::from_millis(5), |h: &Handle| h.stop());

    assert_eq!(el.block_on(promise), Err(Error::Cancelled));
}

#[test]
#[should_panic(expected = "deadlock")]
fn blocking_on_an_unsettleable_promise_is_a_deadlock() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (promise, _settler) = h.promise::<u32>();
    let _ = el.block_on(promise);
}

#[test]
fn tasks_resume_in_fifo_order() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let tasks: Vec<strand::Job<()>> = (1..=3)
        .map(|i| {
            let order = Rc::clone(&order);
            let h = h.clone();
            strand::Job::from(h.spawn(async move {
                order.borrow_mut().push(i);
            }))
        })
        .collect();

    el.block_on(strand::all(&h, tasks)).unwrap().unwrap();
    assert_eq!(&*order.borrow(), &[1, 2, 3]);
}

#[test]
fn task_errors_and_rejections_are_one_channel() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let failing = h.try_spawn(async { Err::<u32, Error>(Error::Config("bad".into())) });
    assert_eq!(el.block_on(failing).unwrap(), Err(Error::Config("bad".into())));

    let panicking: strand::Promise<()> = h.spawn(async { panic!("kaboom") });
    assert_eq!(
        el.block_on(panicking).unwrap(),
        Err(Error::Panicked("kaboom".into()))
    );
}

#[test]
fn a_panicking_callback_does_not_halt_the_loop() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let ran = Rc::new(RefCell::new(false));
    h.next_tick(|_h| panic!("scheduled callback exploded"));
    {
        let ran = Rc::clone(&ran);
        h.add_timer(Duration::from_millis(5), move |_h| *ran.borrow_mut() = true);
    }

    el.run_until_idle();
    assert!(*ran.borrow(), "work after the panicking callback still ran");
}

#[test]
fn awaiting_inside_tasks_suspends_and_resumes() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let h2 = h.clone();
    let result = el
        .block_on(h.spawn(async move {
            let before = Instant::now();
            h2.delay(Duration::from_millis(20)).await.unwrap();
            before.elapsed()
        }))
        .unwrap()
        .unwrap();
    assert!(result >= Duration::from_millis(20));
}

#[test]
fn spawn_blocking_runs_off_loop_and_settles_on_loop() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();

    let loop_thread = std::thread::current().id();
    let worker = el
        .block_on(h.spawn_blocking(move || Ok(std::thread::current().id())))
        .unwrap()
        .unwrap();
    assert_ne!(worker, loop_thread);

    let panicked = el.block_on(h.spawn_blocking::<u32, _>(|| panic!("worker died")));
    assert_eq!(panicked.unwrap(), Err(Error::Panicked("worker died".into())));
}

#[test]
fn current_handle_is_visible_only_inside_the_loop() {
    assert!(Handle::try_current().is_none());
    assert_eq!(Handle::current().unwrap_err(), Error::NotInTask);

    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let in_task = el
        .block_on(h.spawn(async { Handle::try_current().is_some() }))
        .unwrap()
        .unwrap();
    assert!(in_task);
    assert!(Handle::try_current().is_none(), "guard restored on exit");
}

#[test]
fn run_helpers_and_benchmark() {
    let el = EventLoop::new().unwrap();

    let value = el
        .run(|h| h.delay(Duration::from_millis(5)).map(|_| 11_u32))
        .unwrap();
    assert_eq!(value, 11);

    let (value, took) = el
        .benchmark(|h| h.delay(Duration::from_millis(20)).map(|_| "bench"))
        .unwrap();
    assert_eq!(value, "bench");
    assert!(took >= Duration::from_millis(20));

    let timed_out = el.run_with_timeout(
        |h| h.delay(Duration::from_secs(2)).map(|_| ()),
        Duration::from_millis(10),
    );
    assert_eq!(timed_out, Err(Error::Timeout(Duration::from_millis(10))));

    let jobs = (1..=3)
        .map(|i| {
            strand::Job::lazy(move |h: &Handle| h.delay(Duration::from_millis(2)).map(move |_| i))
        })
        .collect();
    assert_eq!(el.run_all(jobs).unwrap(), vec![1, 2, 3]);
}

#[test]
fn is_idle_reflects_queued_immediate_work() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    assert!(h.is_idle());
    h.next_tick(|_h| {});
    assert!(!h.is_idle());
    el.run_until_idle();
    assert!(h.is_idle());
}
