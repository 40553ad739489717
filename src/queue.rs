//! Gated multi-producer multi-consumer queue.
//!
//! # Design
//!
//! `Queue<T>` pairs a `VecDeque<T>` with a producer count and a condvar.
//! Consumers blocked in [`Queue::consume`] wake either when an item arrives
//! (`notify_one`, mirroring a single `pthread_cond_signal`) or when the last
//! producer deregisters (`notify_all`, the "drain avalanche": every blocked
//! consumer wakes at once and sees `producer_count == 0`). Once a queue has
//! drained this way it never blocks a consumer again — the predicate
//! `!items.is_empty() || producer_count == 0` only ever becomes permanently
//! true for the right half once producers hit zero.
//!
//! Lock/scan operations that need to see or rewrite several items at once
//! (the routers' `change_destination`) take the queue's mutex directly via
//! [`Queue::lock`], which returns a guard scoped to the borrow — dropping
//! the guard is the unlock.
//!
//! A poisoned mutex or condvar means a producer or consumer panicked while
//! holding the lock; at that point the queue's internal invariants cannot
//! be trusted, so every accessor here panics rather than return a degraded
//! view of the queue.
//!
//! # Example
//!
//! ```
//! use bearerbox::queue::Queue;
//! use std::sync::Arc;
//!
//! let q: Arc<Queue<i32>> = Arc::new(Queue::new());
//! q.add_producer();
//! q.produce(1);
//! q.produce(2);
//! q.remove_producer();
//! assert_eq!(q.consume(), Some(1));
//! assert_eq!(q.consume(), Some(2));
//! assert_eq!(q.consume(), None); // drained
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

struct Inner<T> {
    items: VecDeque<(Instant, T)>,
    producer_count: usize,
    last_mod: Instant,
}

pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Queue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                producer_count: 0,
                last_mod: Instant::now(),
            }),
            not_empty: Condvar::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("queue mutex poisoned")
    }

    /// Register a producer. Must be called before that producer's first
    /// [`Queue::produce`]. Always permitted, including on a drained queue —
    /// callers that intend to keep the queue alive across a drain re-add a
    /// producer before anyone observes the drained state.
    pub fn add_producer(&self) {
        let mut inner = self.lock_inner();
        inner.producer_count += 1;
        inner.last_mod = Instant::now();
    }

    /// Deregister a producer. When the count reaches zero every blocked
    /// consumer is woken with the drain sentinel (`None`).
    pub fn remove_producer(&self) {
        let mut inner = self.lock_inner();
        debug_assert!(inner.producer_count > 0, "remove_producer without matching add_producer");
        inner.producer_count = inner.producer_count.saturating_sub(1);
        inner.last_mod = Instant::now();
        if inner.producer_count == 0 {
            drop(inner);
            self.not_empty.notify_all();
        }
    }

    pub fn producer_count(&self) -> usize {
        self.lock_inner().producer_count
    }

    /// Append `item` at the tail and wake one blocked consumer, if any.
    pub fn produce(&self, item: T) {
        let mut inner = self.lock_inner();
        inner.items.push_back((Instant::now(), item));
        inner.last_mod = Instant::now();
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Take the head item, blocking while the queue is empty and at least
    /// one producer remains. Returns `None` once the queue has drained.
    pub fn consume(&self) -> Option<T> {
        let mut inner = self.lock_inner();
        loop {
            if let Some((_, item)) = inner.items.pop_front() {
                inner.last_mod = Instant::now();
                return Some(item);
            }
            if inner.producer_count == 0 {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .expect("queue condvar poisoned");
        }
    }

    /// Non-blocking variant: `None` whether the queue is merely empty or
    /// fully drained.
    pub fn try_consume(&self) -> Option<T> {
        let mut inner = self.lock_inner();
        let item = inner.items.pop_front().map(|(_, item)| item);
        if item.is_some() {
            inner.last_mod = Instant::now();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.lock_inner().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_mod_time(&self) -> Instant {
        self.lock_inner().last_mod
    }

    pub fn oldest_item_time(&self) -> Option<Instant> {
        self.lock_inner().items.front().map(|(t, _)| *t)
    }

    /// Hold the internal lock for a batch scan/mutation. The returned guard
    /// is the unlock boundary — it releases the lock when dropped.
    pub fn lock(&self) -> QueueGuard<'_, T> {
        QueueGuard {
            guard: self.lock_inner(),
        }
    }

    /// Rewrite every item for which `matches` returns true, in place, under
    /// a single lock acquisition. Returns the number of items rewritten.
    /// Generalizes the source's `(class, type, routing_key, old_dest,
    /// new_dest)` parameters into caller-supplied predicate/mutator
    /// closures, since this queue is generic over `T` rather than
    /// hardcoded to a message type with those fields.
    pub fn change_destination<F, R>(&self, matches: F, mut rewrite: R) -> usize
    where
        F: Fn(&T) -> bool,
        R: FnMut(&mut T),
    {
        let mut inner = self.lock_inner();
        let mut count = 0;
        for (_, item) in inner.items.iter_mut() {
            if matches(item) {
                rewrite(item);
                count += 1;
            }
        }
        if count > 0 {
            inner.last_mod = Instant::now();
        }
        count
    }
}

pub struct QueueGuard<'a, T> {
    guard: MutexGuard<'a, Inner<T>>,
}

impl<'a, T> QueueGuard<'a, T> {
    pub fn len(&self) -> usize {
        self.guard.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.guard.items.iter().map(|(_, item)| item)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.guard.items.iter_mut().map(|(_, item)| item)
    }

    /// Explicit unlock, for callers that prefer it spelled out over letting
    /// the guard fall out of scope.
    pub fn unlock(self) {}
}
