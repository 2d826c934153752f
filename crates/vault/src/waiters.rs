// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Generic waiter registry (spec §4.3): express "at most one thread does X
//! for key K at a time" and "wake me when X for K finishes".
//!
//! Three instances share this one type: terminator waiters keyed by
//! `JobId`, starting-step barriers keyed by `(JobId, StepId)`, and the
//! prolog-running set keyed by `JobId`. All waiters for all keys share one
//! condition variable — the teacher takes the same small-footprint
//! approach for its connection backpressure gate (`daemon::listener`'s
//! accept-throttle condvar) rather than one cv per key.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

/// A mutex+condvar-guarded set of "busy" keys.
pub struct WaiterSet<K> {
    entries: Mutex<HashSet<K>>,
    cv: Condvar,
}

impl<K: Eq + Hash + Clone> Default for WaiterSet<K> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashSet::new()), cv: Condvar::new() }
    }
}

impl<K: Eq + Hash + Clone> WaiterSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key` if absent. Returns `false` if it was already present
    /// (the caller should treat this as "someone else is already doing
    /// this" and skip its own work, per spec §4.3's TerminateJob dedup).
    pub fn insert_if_absent(&self, key: K) -> bool {
        self.entries.lock().insert(key)
    }

    /// Removes `key` if present and wakes every waiter (spurious wakeups
    /// for unrelated keys are expected and tolerated).
    pub fn remove_and_broadcast(&self, key: &K) {
        let mut entries = self.entries.lock();
        entries.remove(key);
        drop(entries);
        self.cv.notify_all();
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.lock().contains(key)
    }

    /// Blocks until `key` is absent from the set, or `timeout` elapses.
    /// Returns `true` if the key cleared, `false` on timeout.
    pub fn wait_until_absent(&self, key: &K, timeout: Duration) -> bool {
        let mut entries = self.entries.lock();
        let deadline = std::time::Instant::now() + timeout;
        while entries.contains(key) {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let result = self.cv.wait_for(&mut entries, remaining);
            if result.timed_out() {
                return !entries.contains(key);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_if_absent_rejects_second_concurrent_entry() {
        let set: WaiterSet<u32> = WaiterSet::new();
        assert!(set.insert_if_absent(100));
        assert!(!set.insert_if_absent(100), "second insert for the same key must be rejected");
    }

    #[test]
    fn remove_and_broadcast_wakes_a_blocked_waiter() {
        let set = Arc::new(WaiterSet::<u32>::new());
        assert!(set.insert_if_absent(100));

        let waiter = {
            let set = Arc::clone(&set);
            thread::spawn(move || set.wait_until_absent(&100, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        set.remove_and_broadcast(&100);

        assert!(waiter.join().unwrap(), "waiter should observe the key clearing, not time out");
    }

    #[test]
    fn wait_until_absent_returns_immediately_when_key_never_present() {
        let set: WaiterSet<u32> = WaiterSet::new();
        assert!(set.wait_until_absent(&999, Duration::from_millis(10)));
    }
}
