// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The file-broadcast transfer list's read/write lock (spec §4.8
//! "Locking"): a mutex, a condvar, and three counters rather than a plain
//! `std::sync::RwLock`, because the spec calls for a policy
//! `RwLock` doesn't give you — "writes preempt new readers" — a waiting
//! writer blocks every reader that would otherwise have raced in ahead of
//! it, the same starvation-avoidance shape the teacher's `storage::wal`
//! write-lock favors over a library rwlock for its own append path.

use parking_lot::{Condvar, Mutex};

struct State {
    readers: u32,
    writers_waiting: u32,
    writer_active: bool,
}

/// A read/write lock where a waiting writer blocks new readers from
/// acquiring (but does not preempt readers already holding the lock).
pub struct PreemptingRwLock {
    state: Mutex<State>,
    cv: Condvar,
}

impl Default for PreemptingRwLock {
    fn default() -> Self {
        Self { state: Mutex::new(State { readers: 0, writers_waiting: 0, writer_active: false }), cv: Condvar::new() }
    }
}

pub struct ReadGuard<'a> {
    lock: &'a PreemptingRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.cv.notify_all();
        }
    }
}

pub struct WriteGuard<'a> {
    lock: &'a PreemptingRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer_active = false;
        self.lock.cv.notify_all();
    }
}

impl PreemptingRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks while a writer is active or waiting, then acquires for
    /// reading. New readers queue behind any writer that is already
    /// waiting, even if that writer hasn't acquired yet.
    pub fn read(&self) -> ReadGuard<'_> {
        let mut state = self.state.lock();
        while state.writer_active || state.writers_waiting > 0 {
            self.cv.wait(&mut state);
        }
        state.readers += 1;
        ReadGuard { lock: self }
    }

    /// Blocks until every reader has released and no other writer holds
    /// the lock, then acquires for writing.
    pub fn write(&self) -> WriteGuard<'_> {
        let mut state = self.state.lock();
        state.writers_waiting += 1;
        while state.writer_active || state.readers > 0 {
            self.cv.wait(&mut state);
        }
        state.writers_waiting -= 1;
        state.writer_active = true;
        WriteGuard { lock: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn multiple_readers_can_hold_concurrently() {
        let lock = PreemptingRwLock::new();
        let g1 = lock.read();
        let g2 = lock.read();
        drop(g1);
        drop(g2);
    }

    #[test]
    fn waiting_writer_blocks_a_new_reader() {
        let lock = Arc::new(PreemptingRwLock::new());
        let first_reader = lock.read();

        let writer_waiting = Arc::new(AtomicBool::new(false));
        let writer_done = Arc::new(AtomicBool::new(false));
        let lock2 = Arc::clone(&lock);
        let flag2 = Arc::clone(&writer_waiting);
        let done2 = Arc::clone(&writer_done);
        let writer = thread::spawn(move || {
            flag2.store(true, Ordering::SeqCst);
            let _g = lock2.write();
            done2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(writer_waiting.load(Ordering::SeqCst));
        assert!(!writer_done.load(Ordering::SeqCst), "writer should still be blocked by the held reader");

        drop(first_reader);
        writer.join().unwrap();
        assert!(writer_done.load(Ordering::SeqCst));
    }
}
