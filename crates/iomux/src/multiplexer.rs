// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor-connection multiplexer (spec §4.7): owns the listening
//! sockets a step's supervisors dial back into, learns each connection's
//! node index from its init header, and fans node-wide operations
//! (down-node, abort, connection-test) out across every connected
//! `IOServer` without the caller needing to track sockets itself.
//!
//! One instance per step, built once the step's node count is known (the
//! step launcher's `TreeParams::max_depth` sibling field), torn down when
//! the step completes. `IOServer`/`FileSink`/`FileSource` stay unaware of
//! sockets entirely — this is the one place in the crate that owns them.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::buffer_pool::BufferPool;
use crate::ioserver::{FileSink, FileSource, FrameHeader, IOServer, StreamType};

/// Supervisors connect back in groups of at most this many per listening
/// port (spec §4.7: "a step's client I/O sockets are sized so at most 48
/// supervisors share one port").
pub const MAX_SERVERS_PER_PORT: u32 = 48;

pub const IO_PROTOCOL_VERSION: u16 = 1;
pub const MIN_SUPPORTED_IO_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum MultiplexerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported client I/O protocol version {version} (minimum {minimum})")]
    UnsupportedVersion { version: u16, minimum: u16 },

    #[error("node index {0} out of range (num_nodes {1})")]
    NodeIndexOutOfRange(u32, u32),
}

/// The fixed-size header a supervisor sends immediately after dialing
/// back, before any stdout/stderr frame (spec §4.7 "accept path"):
/// protocol version, this supervisor's node index, and how many stdout/
/// stderr streams it will multiplex (one pair per task it launched).
#[derive(Debug, Clone, Copy)]
pub struct InitHeader {
    pub version: u16,
    pub node_index: u32,
    pub stdout_count: u32,
    pub stderr_count: u32,
}

impl InitHeader {
    const WIRE_LEN: usize = 2 + 4 + 4 + 4;

    pub fn read_from(r: &mut impl Read) -> std::io::Result<Self> {
        let mut buf = [0u8; Self::WIRE_LEN];
        r.read_exact(&mut buf)?;
        Ok(Self {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            node_index: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            stdout_count: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            stderr_count: u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]),
        })
    }

    pub fn write_to(&self, w: &mut impl Write) -> std::io::Result<()> {
        w.write_all(&self.version.to_be_bytes())?;
        w.write_all(&self.node_index.to_be_bytes())?;
        w.write_all(&self.stdout_count.to_be_bytes())?;
        w.write_all(&self.stderr_count.to_be_bytes())
    }
}

struct Connected {
    server: Arc<Mutex<IOServer>>,
    stream: TcpStream,
}

/// Coordinates every supervisor connection for one step's client I/O.
pub struct Multiplexer {
    num_nodes: u32,
    listeners: Vec<TcpListener>,
    connected: Mutex<HashMap<u32, Connected>>,
    pool: Arc<BufferPool>,
    ready: Mutex<u32>,
    ready_cv: Condvar,
}

impl Multiplexer {
    /// Binds enough listening sockets to host `num_nodes` supervisors at
    /// `MAX_SERVERS_PER_PORT` each, each on an ephemeral port.
    pub fn bind(num_nodes: u32) -> std::io::Result<Self> {
        let port_count = num_nodes.div_ceil(MAX_SERVERS_PER_PORT).max(1);
        let mut listeners = Vec::with_capacity(port_count as usize);
        for _ in 0..port_count {
            listeners.push(TcpListener::bind("127.0.0.1:0")?);
        }
        Ok(Self {
            num_nodes,
            listeners,
            connected: Mutex::new(HashMap::new()),
            pool: Arc::new(BufferPool::new()),
            ready: Mutex::new(0),
            ready_cv: Condvar::new(),
        })
    }

    /// The ports this multiplexer is listening on, handed to the step
    /// launcher for the `self_addr` envelope section (spec §4.5 step 3(g)).
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().filter_map(|l| l.local_addr().ok()).map(|a| a.port()).collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Accepts and registers one supervisor connection on `listener_index`.
    /// Rejects a version below the minimum or a node index that isn't
    /// `< num_nodes` (spec §4.7: "the init-header nodeid must be <
    /// num_nodes"). A duplicate node index is not an error: the older
    /// connection is logged and evicted in favor of the new one (spec
    /// §4.7: "a duplicate is logged and the older object is evicted").
    pub fn accept_one(&self, listener_index: usize, stdout_sink: Arc<FileSink>, stderr_sink: Arc<FileSink>) -> Result<u32, MultiplexerError> {
        let (mut stream, _) = self.listeners[listener_index].accept()?;
        let header = InitHeader::read_from(&mut stream)?;
        if header.version < MIN_SUPPORTED_IO_VERSION {
            return Err(MultiplexerError::UnsupportedVersion { version: header.version, minimum: MIN_SUPPORTED_IO_VERSION });
        }
        if header.node_index >= self.num_nodes {
            return Err(MultiplexerError::NodeIndexOutOfRange(header.node_index, self.num_nodes));
        }

        let mut connected = self.connected.lock();
        let is_reconnect = if let Some(old) = connected.remove(&header.node_index) {
            tracing::warn!(node_index = header.node_index, "duplicate I/O connection for node index, evicting the older one");
            old.server.lock().mark_down();
            drop(old.stream);
            true
        } else {
            false
        };

        let server = Arc::new(Mutex::new(IOServer::new(
            header.node_index,
            header.stdout_count,
            header.stderr_count,
            stdout_sink,
            stderr_sink,
            Arc::clone(&self.pool),
        )));
        connected.insert(header.node_index, Connected { server, stream });
        drop(connected);

        if !is_reconnect {
            let mut ready = self.ready.lock();
            *ready += 1;
            if *ready >= self.num_nodes {
                self.ready_cv.notify_all();
            }
        }
        Ok(header.node_index)
    }

    /// Blocks until every node this multiplexer expects has connected
    /// (spec §4.7: `FileSource` must not start fanning stdin out until
    /// `ioservers_ready == num_nodes`, or early stdin written before a
    /// slow-to-connect node is up gets silently dropped for it).
    pub fn wait_until_ready(&self) {
        let mut ready = self.ready.lock();
        while *ready < self.num_nodes {
            self.ready_cv.wait(&mut ready);
        }
    }

    pub fn ready_count(&self) -> u32 {
        *self.ready.lock()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.lock().len()
    }

    /// Marks every listed node down (spec §4.7 "Downed-node handling"):
    /// forces its remaining-stream counters to zero so the client sees
    /// clean EOF instead of hanging on a node that will never reply.
    pub fn down_nodes(&self, node_indices: &[u32]) {
        let connected = self.connected.lock();
        for index in node_indices {
            if let Some(entry) = connected.get(index) {
                entry.server.lock().mark_down();
            }
        }
    }

    /// Marks every connected node down — used when the whole step aborts.
    pub fn abort(&self) {
        let connected = self.connected.lock();
        for entry in connected.values() {
            entry.server.lock().mark_down();
        }
    }

    /// Sends a connection-test probe to one node. Returns `false` if that
    /// node isn't connected.
    pub fn send_test_message(&self, node_index: u32) -> bool {
        let connected = self.connected.lock();
        match connected.get(&node_index) {
            Some(entry) => {
                entry.server.lock().send_test_message();
                true
            }
            None => false,
        }
    }

    /// Writes one `FileSource` read to every connected node's stream
    /// (spec §4.7 "Per FileSource (stdin)").
    pub fn broadcast_stdin(&self, source: &FileSource, data: &[u8]) -> std::io::Result<()> {
        let mut connected = self.connected.lock();
        let target_count = connected.len();
        let frames = source.frame_for(data, target_count);
        for ((header, buffer), entry) in frames.into_iter().zip(connected.values_mut()) {
            write_frame(&mut entry.stream, header, buffer.as_slice())?;
        }
        Ok(())
    }

    pub fn server(&self, node_index: u32) -> Option<Arc<Mutex<IOServer>>> {
        self.connected.lock().get(&node_index).map(|e| Arc::clone(&e.server))
    }
}

fn write_frame(stream: &mut TcpStream, header: FrameHeader, body: &[u8]) -> std::io::Result<()> {
    let stream_tag: u8 = match header.stream {
        StreamType::Stdout => 0,
        StreamType::Stderr => 1,
        StreamType::AllStdin => 2,
        StreamType::Stdin => 3,
        StreamType::ConnectionTest => 4,
    };
    stream.write_all(&[stream_tag])?;
    stream.write_all(&header.task_id.to_be_bytes())?;
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as ClientStream;

    fn sinks(pool: &BufferPool) -> (Arc<FileSink>, Arc<FileSink>) {
        (
            Arc::new(FileSink::new(Box::new(Vec::new()), None, None, Arc::clone(&pool.incoming))),
            Arc::new(FileSink::new(Box::new(Vec::new()), None, None, Arc::clone(&pool.incoming))),
        )
    }

    fn connect_and_handshake(port: u16, node_index: u32) -> ClientStream {
        let mut stream = ClientStream::connect(("127.0.0.1", port)).unwrap();
        InitHeader { version: IO_PROTOCOL_VERSION, node_index, stdout_count: 1, stderr_count: 1 }.write_to(&mut stream).unwrap();
        stream
    }

    #[test]
    fn sizes_one_listener_for_small_node_counts() {
        let mux = Multiplexer::bind(4).unwrap();
        assert_eq!(mux.listener_count(), 1);
    }

    #[test]
    fn sizes_multiple_listeners_past_the_per_port_cap() {
        let mux = Multiplexer::bind(MAX_SERVERS_PER_PORT + 1).unwrap();
        assert_eq!(mux.listener_count(), 2);
    }

    #[test]
    fn accept_learns_node_index_from_init_header() {
        let mux = Multiplexer::bind(8).unwrap();
        let port = mux.ports()[0];
        let _client = connect_and_handshake(port, 7);

        let (stdout, stderr) = sinks(&mux.pool);
        let node_index = mux.accept_one(0, stdout, stderr).unwrap();
        assert_eq!(node_index, 7);
        assert_eq!(mux.connected_count(), 1);
    }

    #[test]
    fn node_index_past_num_nodes_is_rejected() {
        let mux = Multiplexer::bind(1).unwrap();
        let port = mux.ports()[0];
        let _client = connect_and_handshake(port, 7);

        let (stdout, stderr) = sinks(&mux.pool);
        let err = mux.accept_one(0, stdout, stderr).unwrap_err();
        assert!(matches!(err, MultiplexerError::NodeIndexOutOfRange(7, 1)));
    }

    #[test]
    fn duplicate_node_index_evicts_the_older_connection() {
        let mux = Multiplexer::bind(2).unwrap();
        let port = mux.ports()[0];

        let _c1 = connect_and_handshake(port, 1);
        let (stdout, stderr) = sinks(&mux.pool);
        mux.accept_one(0, stdout, stderr).unwrap();
        let first_server = mux.server(1).unwrap();
        assert!(!first_server.lock().shutdown());

        let _c2 = connect_and_handshake(port, 1);
        let (stdout, stderr) = sinks(&mux.pool);
        let node_index = mux.accept_one(0, stdout, stderr).unwrap();

        assert_eq!(node_index, 1);
        assert_eq!(mux.connected_count(), 1, "the duplicate should replace, not add to, the connected set");
        assert!(first_server.lock().shutdown(), "the evicted connection's IOServer should be marked down");
        assert!(!mux.server(1).unwrap().lock().shutdown(), "the new connection should be live");
    }

    #[test]
    fn wait_until_ready_unblocks_once_every_node_has_connected() {
        let mux = Arc::new(Multiplexer::bind(2).unwrap());
        let port = mux.ports()[0];

        let _c1 = connect_and_handshake(port, 0);
        let (stdout, stderr) = sinks(&mux.pool);
        mux.accept_one(0, stdout, stderr).unwrap();

        let waiter = {
            let mux = Arc::clone(&mux);
            std::thread::spawn(move || mux.wait_until_ready())
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(!waiter.is_finished(), "must still be blocked on the second node");

        let _c2 = connect_and_handshake(port, 1);
        let (stdout, stderr) = sinks(&mux.pool);
        mux.accept_one(0, stdout, stderr).unwrap();

        waiter.join().unwrap();
        assert_eq!(mux.ready_count(), 2);
    }

    #[test]
    fn down_nodes_marks_only_the_listed_indices() {
        let mux = Multiplexer::bind(2).unwrap();
        let port = mux.ports()[0];

        let _c1 = connect_and_handshake(port, 0);
        let (stdout, stderr) = sinks(&mux.pool);
        mux.accept_one(0, stdout, stderr).unwrap();
        let _c2 = connect_and_handshake(port, 1);
        let (stdout, stderr) = sinks(&mux.pool);
        mux.accept_one(0, stdout, stderr).unwrap();

        mux.down_nodes(&[0]);
        assert!(mux.server(0).unwrap().lock().shutdown());
        assert!(!mux.server(1).unwrap().lock().shutdown());
    }

    #[test]
    fn send_test_message_reports_unknown_node() {
        let mux = Multiplexer::bind(1).unwrap();
        assert!(!mux.send_test_message(99));
    }
}
