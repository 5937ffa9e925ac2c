// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monotonic clock and the ordered wakeup heap.
//!
//! Deadlines are [`Instant`]s — wall-clock time is never consulted. Entries
//! live in a binary min-heap keyed by `(deadline, insertion sequence)`, so
//! equal deadlines fire in insertion order. Cancellation drops the armed
//! callback and leaves a tombstone in the heap, discarded lazily on pop.

use core::cmp::Reverse;
use core::time::Duration;
use std::collections::{BinaryHeap, HashMap};
use std::rc::Rc;
use std::time::Instant;

use crate::event_loop::Handle;
use crate::promise::Promise;

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub(crate) type TimerCallback = Box<dyn FnOnce(&Handle)>;

#[derive(PartialEq, Eq)]
struct Key {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

enum Armed {
    Once(TimerCallback),
    Repeating {
        period: Duration,
        callback: Rc<dyn Fn(&Handle)>,
    },
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<Reverse<Key>>,
    armed: HashMap<TimerId, Armed>,
    next_id: u64,
    next_seq: u64,
}

// === impl TimerHeap ===

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        let id = self.allocate_id();
        self.armed.insert(id, Armed::Once(callback));
        self.push_key(Instant::now() + delay, id);
        id
    }

    pub(crate) fn insert_repeating(
        &mut self,
        period: Duration,
        callback: Rc<dyn Fn(&Handle)>,
    ) -> TimerId {
        let id = self.allocate_id();
        self.armed.insert(id, Armed::Repeating { period, callback });
        self.push_key(Instant::now() + period, id);
        id
    }

    /// Tombstones the timer. Returns whether it was still armed.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Number of armed (non-tombstoned) timers.
    pub(crate) fn armed_len(&self) -> usize {
        self.armed.len()
    }

    /// The earliest live deadline; pops tombstones encountered on the way.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(key)) = self.heap.peek() {
            if self.armed.contains_key(&key.id) {
                return Some(key.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every entry with `deadline <= now`, skipping tombstones, and
    /// returns the fire callbacks in deadline-then-insertion order.
    /// Repeating timers are re-armed for `now + period`.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut fired: Vec<TimerCallback> = Vec::new();

        while let Some(Reverse(key)) = self.heap.peek() {
            if key.deadline > now {
                break;
            }
            let Reverse(key) = self.heap.pop().expect("peeked entry vanished");

            match self.armed.remove(&key.id) {
                None => {} // tombstone
                Some(Armed::Once(callback)) => fired.push(callback),
                Some(Armed::Repeating { period, callback }) => {
                    let fire = Rc::clone(&callback);
                    self.armed.insert(key.id, Armed::Repeating { period, callback });
                    self.push_key(now + period, key.id);
                    fired.push(Box::new(move |handle| fire(handle)));
                }
            }
        }

        if !fired.is_empty() {
            tracing::trace!(expired = fired.len(), "timers fired");
        }
        fired
    }

    fn allocate_id(&mut self) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        id
    }

    fn push_key(&mut self, deadline: Instant, id: TimerId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Key { deadline, seq, id }));
    }
}

// === impl Handle (timer facade) ===

impl Handle {
    /// Schedules `callback` to run once after `delay`.
    pub fn add_timer(&self, delay: Duration, callback: impl FnOnce(&Handle) + 'static) -> TimerId {
        self.shared().timers.borrow_mut().insert(delay, Box::new(callback))
    }

    /// Schedules `callback` to run every `period` until cancelled.
    pub fn interval(&self, period: Duration, callback: impl Fn(&Handle) + 'static) -> TimerId {
        self.shared()
            .timers
            .borrow_mut()
            .insert_repeating(period, Rc::new(callback))
    }

    /// Cancels a timer; the heap discards its entry lazily.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared().timers.borrow_mut().cancel(id)
    }

    /// A cancellable promise fulfilled after `duration`.
    ///
    /// Cancelling it also cancels the underlying timer, so an abandoned
    /// delay does not keep the loop alive.
    pub fn delay(&self, duration: Duration) -> Promise<()> {
        let (promise, settler, cancel) = self.cancellable::<()>();
        let id = self.add_timer(duration, move |_handle| settler.fulfil(()));
        cancel.own_timer(id);
        promise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();

        // insert out of deadline order on purpose
        let late = heap.insert(Duration::from_millis(50), Box::new(|_| {}));
        let early_a = heap.insert(Duration::from_millis(10), Box::new(|_| {}));
        let early_b = heap.insert(Duration::from_millis(10), Box::new(|_| {}));

        let mut order = Vec::new();
        for Reverse(key) in std::iter::from_fn(|| heap.heap.pop()) {
            order.push(key.id);
        }
        assert_eq!(order, vec![early_a, early_b, late]);
        let _ = base;
    }

    #[test]
    fn cancelled_timers_are_skipped_on_expire() {
        let mut heap = TimerHeap::new();
        let keep = heap.insert(Duration::from_millis(0), noop());
        let drop_me = heap.insert(Duration::from_millis(0), noop());

        assert!(heap.cancel(drop_me));
        assert!(!heap.cancel(drop_me), "cancel is idempotent");

        let fired = heap.expire(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(heap.armed_len(), 0);
        let _ = keep;
    }

    #[test]
    fn next_deadline_skips_tombstones() {
        let mut heap = TimerHeap::new();
        let a = heap.insert(Duration::from_millis(5), noop());
        let b = heap.insert(Duration::from_millis(20), noop());
        heap.cancel(a);

        let next = heap.next_deadline().expect("b is still armed");
        assert!(next >= Instant::now());
        // the tombstoned entry must have been popped
        assert_eq!(heap.heap.len(), 1);
        let _ = b;
    }

    #[test]
    fn repeating_timer_rearms_until_cancelled() {
        let mut heap = TimerHeap::new();
        let id = heap.insert_repeating(Duration::from_millis(1), Rc::new(|_| {}));

        let fired = heap.expire(Instant::now() + Duration::from_millis(2));
        assert_eq!(fired.len(), 1);
        assert_eq!(heap.armed_len(), 1, "still armed after firing");

        heap.cancel(id);
        let fired = heap.expire(Instant::now() + Duration::from_millis(10));
        assert!(fired.is_empty());
    }
}
