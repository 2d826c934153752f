// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client I/O multiplexer (spec §4.7): one `IOServer` per connected
//! supervisor, `FileSink`s that drain stdout/stderr to the submitting
//! client, and a `FileSource` that fans stdin back out to every node.

use crate::buffer_pool::{BufferFreelist, BufferPool, IOBuffer};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Framed stream kinds a supervisor connection multiplexes (spec §4.7:
/// "type ∈ {stdout, stderr, allstdin, stdin, connection-test}").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
    AllStdin,
    Stdin,
    ConnectionTest,
}

/// One parsed frame header: stream type, originating task id, and body
/// length. A `length == 0` body means EOF for that stream type.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub stream: StreamType,
    pub task_id: u32,
    pub length: u32,
}

/// Per-node I/O multiplexer state. Tracks the two remaining-stream
/// counters the readable contract depends on, and the "is this node being
/// probed with a connection-test" flag.
pub struct IOServer {
    node_index: u32,
    stdout_remaining: u32,
    stderr_remaining: u32,
    stdin_eof: bool,
    testing_connection: AtomicBool,
    questionable: AtomicBool,
    shutdown: bool,
    stdout_sink: Arc<FileSink>,
    stderr_sink: Arc<FileSink>,
    pool: Arc<BufferPool>,
    pending_bytes: std::sync::atomic::AtomicU64,
}

impl IOServer {
    pub fn new(node_index: u32, stdout_count: u32, stderr_count: u32, stdout_sink: Arc<FileSink>, stderr_sink: Arc<FileSink>, pool: Arc<BufferPool>) -> Self {
        Self {
            node_index,
            stdout_remaining: stdout_count,
            stderr_remaining: stderr_count,
            stdin_eof: false,
            testing_connection: AtomicBool::new(false),
            questionable: AtomicBool::new(false),
            shutdown: false,
            stdout_sink,
            stderr_sink,
            pool,
            pending_bytes: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn node_index(&self) -> u32 {
        self.node_index
    }

    /// Total stdout/stderr bytes handed to a sink over this server's
    /// lifetime, surfaced on the health-check reply and read by tests; not
    /// load-bearing for any protocol decision.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Acquire)
    }

    /// `readable() = ¬in_eof ∧ (stdout_count > 0 ∨ stderr_count > 0 ∨
    /// testing_connection) ∧ free-buffer-available` (spec §4.7). The
    /// free-buffer clause implements backpressure: once the incoming
    /// freelist has nothing spare (and would need to allocate past its
    /// cap) we stop asking the peer for more.
    pub fn readable(&self) -> bool {
        let has_work = self.stdout_remaining > 0 || self.stderr_remaining > 0 || self.testing_connection.load(Ordering::Acquire);
        !self.stdin_eof && has_work && self.pool.incoming.has_free()
    }

    pub fn shutdown(&self) -> bool {
        self.shutdown
    }

    /// Processes one parsed frame (spec §4.7 read loop). `body` is empty
    /// for an EOF frame.
    pub fn handle_frame(&mut self, header: FrameHeader, body: &[u8]) {
        match header.stream {
            StreamType::Stdout | StreamType::Stderr => {
                if header.length == 0 {
                    self.decrement(header.stream);
                } else {
                    let buffer = self.pool.incoming.acquire(body);
                    self.pending_bytes.fetch_add(body.len() as u64, Ordering::AcqRel);
                    let sink = match header.stream {
                        StreamType::Stdout => &self.stdout_sink,
                        _ => &self.stderr_sink,
                    };
                    sink.enqueue(header.task_id, buffer);
                }
            }
            StreamType::ConnectionTest => {
                self.testing_connection.store(false, Ordering::Release);
                self.questionable.store(false, Ordering::Release);
            }
            StreamType::AllStdin | StreamType::Stdin => {
                // Inbound frames of these kinds are not expected on the
                // supervisor->agent direction; treated as a protocol error
                // by the caller, which will close the connection.
            }
        }

        if self.stdout_remaining == 0 && self.stderr_remaining == 0 {
            self.shutdown = true;
        }
    }

    fn decrement(&mut self, stream: StreamType) {
        match stream {
            StreamType::Stdout => self.stdout_remaining = self.stdout_remaining.saturating_sub(1),
            StreamType::Stderr => self.stderr_remaining = self.stderr_remaining.saturating_sub(1),
            _ => {}
        }
    }

    /// Marks this node down: forces the remaining counters to zero and
    /// requests shutdown (spec §4.7 "Downed-node handling").
    pub fn mark_down(&mut self) {
        self.stdout_remaining = 0;
        self.stderr_remaining = 0;
        self.shutdown = true;
    }

    pub fn send_test_message(&self) {
        self.testing_connection.store(true, Ordering::Release);
    }
}

/// One queued outbound buffer tagged with the task it came from, so a
/// `FileSink`'s optional task-id filter can drop it before writing.
struct QueuedBuffer {
    task_id: u32,
    buffer: IOBuffer,
}

/// Drains one IOBuffer at a time to a destination writer, honoring an
/// optional task-id filter and an optional `[%N]`-style label prefix
/// padded to the task-id width (spec §4.7 "Per FileSink").
pub struct FileSink {
    queue: parking_lot::Mutex<VecDeque<QueuedBuffer>>,
    writer: parking_lot::Mutex<Box<dyn Write + Send>>,
    task_filter: Option<u32>,
    label_width: Option<usize>,
    incoming_pool: Arc<BufferFreelist>,
}

impl FileSink {
    pub fn new(writer: Box<dyn Write + Send>, task_filter: Option<u32>, label_width: Option<usize>, incoming_pool: Arc<BufferFreelist>) -> Self {
        Self { queue: parking_lot::Mutex::new(VecDeque::new()), writer: parking_lot::Mutex::new(writer), task_filter, label_width, incoming_pool }
    }

    pub fn enqueue(&self, task_id: u32, buffer: IOBuffer) {
        self.queue.lock().push_back(QueuedBuffer { task_id, buffer });
    }

    /// Drains and writes every currently queued buffer, EINTR-safely.
    /// Every dequeued buffer — written or filtered out — is released back
    /// to the incoming freelist (spec §4.7: "decrement buffer refcount
    /// (return to freelist at 0), advance to next buffer"), which is what
    /// keeps `IOServer::readable`'s free-buffer-available clause honest.
    pub fn flush_all(&self) -> std::io::Result<()> {
        loop {
            let next = self.queue.lock().pop_front();
            let Some(queued) = next else { break };

            if let Some(filter) = self.task_filter {
                if queued.task_id != filter {
                    self.incoming_pool.release(queued.buffer);
                    continue;
                }
            }

            let result = self.write_with_label(queued.task_id, queued.buffer.as_slice());
            self.incoming_pool.release(queued.buffer);
            result?;
        }
        Ok(())
    }

    fn write_with_label(&self, task_id: u32, body: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock();
        if let Some(width) = self.label_width {
            let label = format!("{:>width$}: ", task_id, width = width);
            write_all_eintr(&mut *writer, label.as_bytes())?;
        }
        write_all_eintr(&mut *writer, body)
    }
}

/// Task-id label width for a step of `num_tasks` tasks: `ceil(log10(n))`,
/// minimum 1 (`fmt_io_header`'s convention — a 1-task step still gets a
/// one-column label, a 100-task step gets three).
pub fn label_width_for(num_tasks: u32) -> usize {
    if num_tasks <= 1 {
        1
    } else {
        ((num_tasks - 1) as f64).log10().floor() as usize + 1
    }
}

fn write_all_eintr(writer: &mut dyn Write, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Largest single stdin message read per iteration (spec §4.7).
pub const MAX_MSG_LEN: usize = 64 * 1024;

/// Reads client stdin and fans it out to every `IOServer`'s outbound
/// queue, blocking until every node's `IOServer` is ready so early stdin
/// isn't lost (spec §4.7 "Per FileSource (stdin)").
pub struct FileSource {
    broadcast: bool,
}

impl FileSource {
    pub fn new(broadcast: bool) -> Self {
        Self { broadcast }
    }

    /// Builds the outbound frames for one read of `data` (or an EOF frame
    /// if `data` is empty), one per target `IOServer` when broadcasting.
    pub fn frame_for(&self, data: &[u8], target_count: usize) -> Vec<(FrameHeader, IOBuffer)> {
        let stream = if self.broadcast { StreamType::AllStdin } else { StreamType::Stdin };
        let header = FrameHeader { stream, task_id: 0, length: data.len() as u32 };
        let buffer = IOBuffer::new(data.to_vec());

        let fan_out = if self.broadcast { target_count } else { 1 };
        (0..fan_out).map(|_| (header, buffer.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinks(pool: &BufferPool) -> (Arc<FileSink>, Arc<FileSink>) {
        (
            Arc::new(FileSink::new(Box::new(Vec::new()), None, Some(2), Arc::clone(&pool.incoming))),
            Arc::new(FileSink::new(Box::new(Vec::new()), None, Some(2), Arc::clone(&pool.incoming))),
        )
    }

    #[test]
    fn readable_is_false_once_both_counters_reach_zero() {
        let pool = Arc::new(BufferPool::new());
        let (stdout, stderr) = sinks(&pool);
        let mut server = IOServer::new(0, 1, 1, stdout, stderr, pool);
        assert!(server.readable());

        server.handle_frame(FrameHeader { stream: StreamType::Stdout, task_id: 0, length: 0 }, &[]);
        assert!(server.readable(), "stderr still outstanding");

        server.handle_frame(FrameHeader { stream: StreamType::Stderr, task_id: 0, length: 0 }, &[]);
        assert!(!server.readable());
        assert!(server.shutdown());
    }

    /// The free-buffer-available clause of `readable()` (spec §4.7): once
    /// the incoming freelist has `STDIO_MAX_FREE_BUF` buffers checked out
    /// and unreleased, the server stops declaring itself readable even
    /// though both stream counters are still open, and recovers once a
    /// sink flush releases buffers back below the cap.
    #[test]
    fn readable_applies_backpressure_once_the_incoming_pool_is_exhausted() {
        let pool = Arc::new(BufferPool::new());
        let (stdout, stderr) = sinks(&pool);
        let mut server = IOServer::new(0, 1, 0, Arc::clone(&stdout), stderr, Arc::clone(&pool));
        assert!(server.readable());

        for i in 0..crate::buffer_pool::STDIO_MAX_FREE_BUF {
            server.handle_frame(FrameHeader { stream: StreamType::Stdout, task_id: 0, length: 1 }, &[i as u8]);
        }
        assert!(!server.readable(), "incoming pool should be exhausted");

        stdout.flush_all().unwrap();
        assert!(server.readable(), "releasing buffers back to the pool should restore readability");
    }

    #[test]
    fn connection_test_frame_clears_testing_flag() {
        let pool = Arc::new(BufferPool::new());
        let (stdout, stderr) = sinks(&pool);
        let server = IOServer::new(0, 1, 1, stdout, stderr, pool);
        server.send_test_message();
        assert!(server.testing_connection.load(Ordering::Acquire));

        let mut server = server;
        server.handle_frame(FrameHeader { stream: StreamType::ConnectionTest, task_id: 0, length: 0 }, &[]);
        assert!(!server.testing_connection.load(Ordering::Acquire));
    }

    #[test]
    fn mark_down_forces_shutdown() {
        let pool = Arc::new(BufferPool::new());
        let (stdout, stderr) = sinks(&pool);
        let mut server = IOServer::new(0, 4, 4, stdout, stderr, pool);
        server.mark_down();
        assert!(server.shutdown());
        assert!(!server.readable());
    }

    #[test]
    fn file_source_broadcast_fans_out_to_every_target() {
        let source = FileSource::new(true);
        let frames = source.frame_for(b"hello", 3);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|(h, _)| h.stream == StreamType::AllStdin));
    }

    #[test]
    fn file_source_unicast_sends_once() {
        let source = FileSource::new(false);
        let frames = source.frame_for(b"hello", 3);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.stream, StreamType::Stdin);
    }

    #[test]
    fn label_width_matches_task_count_digits() {
        assert_eq!(label_width_for(1), 1);
        assert_eq!(label_width_for(9), 1);
        assert_eq!(label_width_for(10), 2);
        assert_eq!(label_width_for(100), 3);
        assert_eq!(label_width_for(101), 3);
    }

    #[test]
    fn pending_bytes_accumulates_across_frames() {
        let pool = Arc::new(BufferPool::new());
        let (stdout, stderr) = sinks(&pool);
        let mut server = IOServer::new(0, 2, 0, stdout, stderr, pool);
        server.handle_frame(FrameHeader { stream: StreamType::Stdout, task_id: 0, length: 5 }, b"hello");
        server.handle_frame(FrameHeader { stream: StreamType::Stdout, task_id: 1, length: 3 }, b"abc");
        assert_eq!(server.pending_bytes(), 8);
    }

    #[test]
    fn sink_applies_label_prefix_and_filter() {
        let buffer_out = Arc::new(parking_lot::Mutex::new(Vec::<u8>::new()));
        struct SharedWriter(Arc<parking_lot::Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let incoming_pool = Arc::new(BufferFreelist::new());
        let sink = FileSink::new(Box::new(SharedWriter(Arc::clone(&buffer_out))), Some(1), Some(2), Arc::clone(&incoming_pool));
        sink.enqueue(0, incoming_pool.acquire(b"skip me\n"));
        sink.enqueue(1, incoming_pool.acquire(b"hello\n"));
        sink.flush_all().unwrap();

        let written = String::from_utf8(buffer_out.lock().clone()).unwrap();
        assert_eq!(written, " 1: hello\n");
        assert_eq!(incoming_pool.free_count(), 2, "both buffers should have been released back to the pool");
    }
}
