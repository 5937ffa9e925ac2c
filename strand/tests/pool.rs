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

use strand::pool::{Pool, PoolConfig, PoolGuard, ResourceFactory, TransactionFn};
use strand::{Error, EventLoop, Handle};

#[derive(Debug, Clone)]
struct Conn {
    id: u32,
}

struct ConnFactory {
    next_id: Cell<u32>,
    rollbacks: Rc<RefCell<Vec<u32>>>,
    fail_creates: Cell<bool>,
}

impl ConnFactory {
    fn new() -> (Self, Rc<RefCell<Vec<u32>>>) {
        let rollbacks = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                next_id: Cell::new(1),
                rollbacks: Rc::clone(&rollbacks),
                fail_creates: Cell::new(false),
            },
            rollbacks,
        )
    }
}

impl ResourceFactory<Conn> for ConnFactory {
    fn create(&self, handle: &Handle) -> strand::Promise<Conn> {
        if self.fail_creates.get() {
            return handle.rejected(Error::Connection("backend down".into()));
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        handle.resolved(Conn { id })
    }

    fn recycle(&self, resource: &mut Conn) {
        self.rollbacks.borrow_mut().push(resource.id);
    }
}

fn pool_of(h: &Handle, max: usize) -> (Pool<Conn>, Rc<RefCell<Vec<u32>>>) {
    let (factory, rollbacks) = ConnFactory::new();
    (
        Pool::new(
            h,
            factory,
            PoolConfig {
                max,
                ..PoolConfig::default()
            },
        ),
        rollbacks,
    )
}

#[test]
fn third_acquire_waits_for_a_release_and_gets_that_resource() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (pool, _rollbacks) = pool_of(&h, 2);

    let h2 = h.clone();
    let pool2 = pool.clone();
    el.block_on(h.spawn(async move {
        let g1 = pool2.get().await.unwrap();
        let g2 = pool2.get().await.unwrap();
        let first_id = g1.with(|conn| conn.id);

        let third = pool2.get();
        h2.delay(Duration::from_millis(5)).await.unwrap();
        assert!(
            third.clone().now_or_never().is_none(),
            "third acquire must wait at max capacity"
        );

        pool2.release(g1);
        let g3 = third.await.unwrap();
        assert_eq!(
            g3.with(|conn| conn.id),
            first_id,
            "waiter receives the released resource"
        );

        pool2.release(g2);
        pool2.release(g3);
    }))
    .unwrap()
    .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.acquired - stats.released, stats.in_use as u64);
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle + stats.in_use <= 2);
}

#[test]
fn close_rejects_waiters_and_later_acquires() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (pool, _rollbacks) = pool_of(&h, 1);

    let pool2 = pool.clone();
    el.block_on(h.spawn(async move {
        let guard = pool2.get().await.unwrap();
        let waiting = pool2.get();

        pool2.close();
        assert_eq!(waiting.await, Err(Error::PoolClosed));
        assert_eq!(pool2.get().await, Err(Error::PoolClosed));

        // a resource returned to a closed pool is destroyed
        pool2.release(guard);
        assert_eq!(pool2.stats().in_use, 0);
    }))
    .unwrap()
    .unwrap();
    assert!(pool.is_closed());
}

#[test]
fn factory_failure_rejects_the_acquire() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (factory, _) = ConnFactory::new();
    factory.fail_creates.set(true);
    let pool = Pool::new(&h, factory, PoolConfig::default());

    let result = el.block_on(pool.get()).unwrap();
    assert_eq!(result.map(|_| ()), Err(Error::Connection("backend down".into())));
}

#[test]
fn min_preallocates_resources() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (factory, _) = ConnFactory::new();
    let pool = Pool::new(
        &h,
        factory,
        PoolConfig {
            min: 2,
            max: 4,
            ..PoolConfig::default()
        },
    );

    el.run_until_idle();
    let stats = pool.stats();
    assert_eq!(stats.created, 2);
    assert_eq!(stats.idle, 2);
}

#[test]
fn expired_idle_resources_are_replaced_on_acquire() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (factory, _) = ConnFactory::new();
    let pool = Pool::new(
        &h,
        factory,
        PoolConfig {
            max: 2,
            idle_timeout: Some(Duration::from_millis(10)),
            ..PoolConfig::default()
        },
    );

    let h2 = h.clone();
    let pool2 = pool.clone();
    el.block_on(h.spawn(async move {
        let guard = pool2.get().await.unwrap();
        let first_id = guard.with(|conn| conn.id);
        pool2.release(guard);

        h2.delay(Duration::from_millis(30)).await.unwrap();

        let fresh = pool2.get().await.unwrap();
        assert_ne!(
            fresh.with(|conn| conn.id),
            first_id,
            "idle-expired resource must be discarded and replaced"
        );
        pool2.release(fresh);
    }))
    .unwrap()
    .unwrap();
    assert_eq!(pool.stats().discarded, 1);
}

#[test]
fn racing_transactions_first_fulfilment_wins_and_losers_roll_back() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (pool, rollbacks) = pool_of(&h, 2);
    let started = Instant::now();

    let transactions: Vec<TransactionFn<Conn, &'static str>> = vec![
        Box::new(|h: &Handle, _guard: PoolGuard<Conn>| {
            h.delay(Duration::from_secs(1)).map(|_| "slow")
        }),
        Box::new(|h: &Handle, _guard: PoolGuard<Conn>| {
            h.delay(Duration::from_millis(10)).map(|_| "fast")
        }),
    ];

    let winner = el.block_on(pool.race(transactions)).unwrap().unwrap();
    assert_eq!(winner, "fast");

    // the loser was cancelled, not waited out
    el.run_until_idle();
    assert!(started.elapsed() < Duration::from_millis(600));

    let stats = pool.stats();
    assert_eq!(stats.in_use, 0, "no connection may leak from a race");
    assert_eq!(
        rollbacks.borrow().len(),
        2,
        "every participant is rolled back on its way home"
    );
}

#[test]
fn racing_transactions_aggregate_when_all_fail() {
    let el = EventLoop::new().unwrap();
    let h = el.handle();
    let (pool, _rollbacks) = pool_of(&h, 2);

    let transactions: Vec<TransactionFn<Conn, u32>> = vec![
        Box::new(|h: &Handle, _guard: PoolGuard<Conn>| {
            h.rejected(Error::Config("tx-1".into()))
        }),
        Box::new(|h: &Handle, _guard: PoolGuard<Conn>| {
            h.rejected(Error::Config("tx-2".into()))
        }),
    ];

    let result = el.block_on(pool.race(transactions)).unwrap();
    assert_eq!(
        result,
        Err(Error::Aggregate(vec![
            Error::Config("tx-1".into()),
            Error::Config("tx-2".into()),
        ]))
    );

    el.run_until_idle();
    assert_eq!(pool.stats().in_use, 0);
}
