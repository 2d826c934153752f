// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event loop (spec §4.1): a single-threaded, level-triggered poll
//! loop over a dynamic set of objects, reused here by `IOServer`'s
//! per-step multiplexer and by `agentd-bcast`/the controller uplink.
//!
//! Grounded on `mio`'s own reactor pattern (`other_examples` pulls in
//! `tokio-rs/mio` directly): a `Poll` plus a `Token`-addressed object map,
//! with a wakeup pipe standing in for mio's `Waker` so a remote thread can
//! both enqueue a new object and force a fresh interest evaluation.

use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

/// Wakeup-pipe byte convention (spec §4.1 step 5), named after the
/// original's `eio.c` constants: `1` marks every object's shutdown flag,
/// `0` means "a new object was enqueued, re-evaluate interests".
pub const EIO_SHUTDOWN: u8 = 1;
pub const EIO_NEW_OBJ: u8 = 0;

/// One object the loop polls. Implementors own their own `fd`/`mio`
/// source; the loop only asks for interest and dispatches callbacks.
pub trait EventObject: Send {
    fn readable(&self) -> bool;
    fn writable(&self) -> bool;
    fn handle_read(&mut self);
    fn handle_write(&mut self);
    fn handle_error(&mut self);
    fn handle_close(&mut self);
    fn shutdown(&self) -> bool;
    fn set_shutdown(&mut self, value: bool);
    fn source(&mut self) -> &mut dyn mio::event::Source;
}

const WAKEUP_TOKEN: Token = Token(usize::MAX);

/// Thread-safe handle used by other threads to enqueue a new object and
/// wake the loop (spec §4.1: "objects may only be added from other
/// threads through the pending queue followed by a wakeup-pipe write").
pub struct LoopHandle {
    pending: std::sync::Arc<Mutex<Vec<Box<dyn EventObject>>>>,
    wakeup: Mutex<pipe::Sender>,
}

impl LoopHandle {
    pub fn enqueue(&self, object: Box<dyn EventObject>) -> std::io::Result<()> {
        self.pending.lock().push(object);
        self.wake(EIO_NEW_OBJ)
    }

    pub fn shutdown_all(&self) -> std::io::Result<()> {
        self.wake(EIO_SHUTDOWN)
    }

    fn wake(&self, byte: u8) -> std::io::Result<()> {
        use std::io::Write;
        self.wakeup.lock().write_all(&[byte])
    }
}

pub struct EventLoop {
    poll: Poll,
    objects: HashMap<Token, Box<dyn EventObject>>,
    pending: std::sync::Arc<Mutex<Vec<Box<dyn EventObject>>>>,
    wakeup_receiver: pipe::Receiver,
    wakeup_sender: pipe::Sender,
    next_token: usize,
    global_shutdown: bool,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let (wakeup_sender, mut wakeup_receiver) = pipe::new()?;
        poll.registry().register(&mut wakeup_receiver, WAKEUP_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            objects: HashMap::new(),
            pending: std::sync::Arc::new(Mutex::new(Vec::new())),
            wakeup_receiver,
            wakeup_sender,
            next_token: 0,
            global_shutdown: false,
        })
    }

    pub fn handle(&self) -> std::io::Result<LoopHandle> {
        Ok(LoopHandle { pending: std::sync::Arc::clone(&self.pending), wakeup: Mutex::new(self.wakeup_sender.try_clone()?) })
    }

    /// Registers an object directly onto the active list. Only safe to
    /// call from inside a handler on the loop's own thread (spec §4.1:
    /// "Objects may be added from inside a handler... directly to the
    /// active list").
    pub fn register_local(&mut self, mut object: Box<dyn EventObject>) -> std::io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let interest = interest_for(object.as_ref());
        if let Some(interest) = interest {
            self.poll.registry().register(object.source(), token, interest)?;
        }
        self.objects.insert(token, object);
        Ok(())
    }

    /// Runs one iteration of the loop (spec §4.1 steps 1-6).
    pub fn tick(&mut self, poll_timeout: Duration) -> std::io::Result<()> {
        // Step 1+2: re-evaluate interest for every object (the wakeup pipe
        // is always registered once, up front, not re-registered here).
        for (token, object) in self.objects.iter_mut() {
            match interest_for(object.as_ref()) {
                Some(interest) => {
                    let _ = self.poll.registry().reregister(object.source(), *token, interest);
                }
                None => {
                    let _ = self.poll.registry().deregister(object.source());
                }
            }
        }

        // Step 3: block in poll until any fd is ready.
        let mut events = Events::with_capacity(128);
        self.poll.poll(&mut events, Some(poll_timeout))?;

        // Step 4: dispatch revents in priority order.
        for event in events.iter() {
            if event.token() == WAKEUP_TOKEN {
                continue;
            }
            let Some(object) = self.objects.get_mut(&event.token()) else { continue };

            let mut handled = false;
            if event.is_error() {
                object.handle_error();
                handled = true;
            }
            if event.is_read_closed() || event.is_write_closed() {
                object.handle_close();
                handled = true;
            }
            if event.is_readable() {
                object.handle_read();
                handled = true;
            }
            if event.is_writable() {
                object.handle_write();
                handled = true;
            }
            if !handled {
                object.set_shutdown(true);
            }
        }

        // Step 5: drain wakeup-pipe bytes.
        let mut byte = [0u8; 1];
        loop {
            match self.wakeup_receiver.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == EIO_SHUTDOWN {
                        self.global_shutdown = true;
                        for object in self.objects.values_mut() {
                            object.set_shutdown(true);
                        }
                    }
                    // EIO_NEW_OBJ needs no action here beyond having woken
                    // us; step 6 below picks up the pending queue either way.
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        // Step 6: move pending objects into the active list.
        let drained: Vec<_> = self.pending.lock().drain(..).collect();
        for object in drained {
            self.register_local(object)?;
        }

        // Remove objects that have asked to shut down.
        self.objects.retain(|_, object| !object.shutdown());

        Ok(())
    }

    /// Runs `tick` until every object has shut down or a global shutdown
    /// was requested, polling with `poll_timeout` each iteration.
    pub fn run_until_empty(&mut self, poll_timeout: Duration) -> std::io::Result<()> {
        while !self.global_shutdown && (!self.objects.is_empty() || !self.pending.lock().is_empty()) {
            self.tick(poll_timeout)?;
        }
        Ok(())
    }
}

fn interest_for(object: &dyn EventObject) -> Option<Interest> {
    match (object.readable(), object.writable()) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingObject {
        reads: Arc<AtomicUsize>,
        shutdown: bool,
        source: pipe::Receiver,
    }

    impl EventObject for CountingObject {
        fn readable(&self) -> bool {
            !self.shutdown
        }
        fn writable(&self) -> bool {
            false
        }
        fn handle_read(&mut self) {
            let mut buf = [0u8; 64];
            use std::io::Read;
            match self.source.read(&mut buf) {
                Ok(0) => self.shutdown = true,
                Ok(n) => {
                    self.reads.fetch_add(n, Ordering::SeqCst);
                }
                Err(_) => self.shutdown = true,
            }
        }
        fn handle_write(&mut self) {}
        fn handle_error(&mut self) {
            self.shutdown = true;
        }
        fn handle_close(&mut self) {
            self.shutdown = true;
        }
        fn shutdown(&self) -> bool {
            self.shutdown
        }
        fn set_shutdown(&mut self, value: bool) {
            self.shutdown = value;
        }
        fn source(&mut self) -> &mut dyn mio::event::Source {
            &mut self.source
        }
    }

    #[test]
    fn tick_delivers_data_written_before_polling() {
        let mut event_loop = EventLoop::new().unwrap();
        let (mut sender, receiver) = pipe::new().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        event_loop
            .register_local(Box::new(CountingObject { reads: Arc::clone(&reads), shutdown: false, source: receiver }))
            .unwrap();

        use std::io::Write;
        sender.write_all(b"hello").unwrap();

        event_loop.tick(Duration::from_millis(200)).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn global_shutdown_byte_marks_every_object() {
        let mut event_loop = EventLoop::new().unwrap();
        let (_sender, receiver) = pipe::new().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        event_loop.register_local(Box::new(CountingObject { reads, shutdown: false, source: receiver })).unwrap();

        let handle = event_loop.handle().unwrap();
        handle.shutdown_all().unwrap();

        event_loop.run_until_empty(Duration::from_millis(200)).unwrap();
        assert!(event_loop.objects.is_empty());
    }
}
