//! Deterministic cascade queue.
//!
//! Propagation pushes events here instead of recursing into every dependent,
//! and the owning graph drains the queue before its public entry point
//! returns. The cascade therefore stays synchronous while callbacks that
//! trigger further resolutions never re-enter the graph mid-update.
//!
//! # Determinism
//! Events are processed in FIFO order. `Check` events are deduplicated
//! until popped, so a key marked several times is examined once per drain.

use super::key::KeyRef;
use std::collections::{BTreeSet, VecDeque};

/// A unit of pending cascade work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `source` propagated; satisfy the wait edge held by `waiter`.
    Resolve { waiter: KeyRef, source: KeyRef },
    /// Re-examine whether `key` can resolve.
    Check(KeyRef),
}

/// FIFO of cascade events with duplicate suppression for checks.
#[derive(Debug, Default)]
pub struct CascadeQueue {
    events: VecDeque<Event>,
    queued_checks: BTreeSet<KeyRef>,
}

impl CascadeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_resolve(&mut self, waiter: KeyRef, source: KeyRef) {
        self.events.push_back(Event::Resolve { waiter, source });
    }

    /// Queues a check unless one for the same key is already waiting.
    pub fn push_check(&mut self, key: KeyRef) {
        if self.queued_checks.insert(key.clone()) {
            self.events.push_back(Event::Check(key));
        }
    }

    /// Queues checks for `keys` in sorted order.
    pub fn push_checks<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = KeyRef>,
    {
        let mut sorted: Vec<KeyRef> = keys.into_iter().collect();
        sorted.sort();
        for key in sorted {
            self.push_check(key);
        }
    }

    pub fn pop(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        if let Event::Check(key) = &event {
            self.queued_checks.remove(key);
        }
        Some(event)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.queued_checks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::DepArena;

    #[test]
    fn checks_are_deduplicated_until_popped() {
        let mut arena = DepArena::new();
        let dep = arena.allocate(());
        let key = KeyRef::new(dep, "symbol");
        let mut queue = CascadeQueue::new();
        queue.push_check(key.clone());
        queue.push_check(key.clone());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(Event::Check(key.clone())));
        queue.push_check(key.clone());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn push_checks_sorts_keys() {
        let mut arena = DepArena::new();
        let dep = arena.allocate(());
        let mut queue = CascadeQueue::new();
        queue.push_checks(vec![KeyRef::new(dep, "b"), KeyRef::new(dep, "a")]);
        assert_eq!(queue.pop(), Some(Event::Check(KeyRef::new(dep, "a"))));
        assert_eq!(queue.pop(), Some(Event::Check(KeyRef::new(dep, "b"))));
        assert!(queue.is_empty());
    }
}
