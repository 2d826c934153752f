// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client I/O multiplexer (spec §4.7): the event loop (§4.1, implemented
//! once here and reused by `agentd-bcast` and the controller uplink),
//! `IOServer`/`FileSink`/`FileSource`, and the buffer pool they share.

pub mod buffer_pool;
pub mod event_loop;
pub mod ioserver;
pub mod multiplexer;

pub use buffer_pool::{BufferFreelist, BufferPool, IOBuffer, STDIO_MAX_FREE_BUF};
pub use event_loop::{EventLoop, EventObject, LoopHandle, EIO_NEW_OBJ, EIO_SHUTDOWN};
pub use ioserver::{label_width_for, FileSink, FileSource, FrameHeader, IOServer, StreamType, MAX_MSG_LEN};
pub use multiplexer::{InitHeader, Multiplexer, MultiplexerError, IO_PROTOCOL_VERSION, MAX_SERVERS_PER_PORT, MIN_SUPPORTED_IO_VERSION};
