// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `SupervisorLink` over the spool directory's per-step unix sockets
//! (spec §4.6: "`SignalTasks` delegates to the supervisor's signal-container
//! operation over its unix socket").
//!
//! Framing stays length-prefixed JSON, the same convention
//! `agentd-engine::launcher` uses for the startup envelope's pipe sections,
//! rather than the controller-facing `agentd-wire` envelope — this is a
//! private, local, unauthenticated transport between trusted processes on
//! the same node.

use agentd_core::{AgentError, JobId, StepId};
use agentd_engine::SupervisorLink;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
enum SupervisorCommand {
    Signal(i32),
    Suspend(bool),
    IsRunning,
}

#[derive(Debug, Serialize, Deserialize)]
enum SupervisorReply {
    Ack,
    Running(bool),
}

/// Looks up a step's socket path without depending on `crate::context`
/// directly, so this module stays testable against a bare function.
pub trait SocketLookup: Send + Sync {
    fn socket_path(&self, job_id: &JobId, step_id: StepId) -> Option<PathBuf>;
}

pub struct UnixSocketSupervisorLink<L: SocketLookup> {
    lookup: L,
}

impl<L: SocketLookup> UnixSocketSupervisorLink<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    fn call(&self, job_id: &JobId, step_id: StepId, command: SupervisorCommand) -> Result<SupervisorReply, AgentError> {
        let path = self
            .lookup
            .socket_path(job_id, step_id)
            .ok_or_else(|| AgentError::StepNotRunning(format!("{job_id}.{step_id}")))?;

        let mut stream = UnixStream::connect(&path)
            .map_err(|e| AgentError::StepNotRunning(format!("{job_id}.{step_id}: {e}")))?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT)).ok();
        stream.set_write_timeout(Some(CONNECT_TIMEOUT)).ok();

        send_framed(&mut stream, &command).map_err(|e| AgentError::TransientComm(e.to_string()))?;
        recv_framed(&mut stream).map_err(|e| AgentError::TransientComm(e.to_string()))
    }
}

impl<L: SocketLookup> SupervisorLink for UnixSocketSupervisorLink<L> {
    fn signal(&self, job_id: &JobId, step_id: StepId, signal: i32) -> Result<(), AgentError> {
        self.call(job_id, step_id, SupervisorCommand::Signal(signal)).map(|_| ())
    }

    fn suspend(&self, job_id: &JobId, step_id: StepId, suspend: bool) -> Result<(), AgentError> {
        self.call(job_id, step_id, SupervisorCommand::Suspend(suspend)).map(|_| ())
    }

    fn is_running(&self, job_id: &JobId, step_id: StepId) -> bool {
        match self.call(job_id, step_id, SupervisorCommand::IsRunning) {
            Ok(SupervisorReply::Running(running)) => running,
            Ok(SupervisorReply::Ack) | Err(_) => false,
        }
    }
}

fn send_framed<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)
}

fn recv_framed<T: serde::de::DeserializeOwned>(stream: &mut UnixStream) -> std::io::Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::net::UnixListener;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MapLookup(HashMap<(JobId, StepId), PathBuf>);
    impl SocketLookup for MapLookup {
        fn socket_path(&self, job_id: &JobId, step_id: StepId) -> Option<PathBuf> {
            self.0.get(&(job_id.clone(), step_id)).cloned()
        }
    }

    #[test]
    fn is_running_false_when_socket_path_is_unknown() {
        let link = UnixSocketSupervisorLink::new(MapLookup(HashMap::new()));
        assert!(!link.is_running(&JobId::from("100"), 0));
    }

    #[test]
    fn signal_against_a_live_socket_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = UnixListener::bind(&path).unwrap();

        let job_id = JobId::from("100");
        let mut lookup = HashMap::new();
        lookup.insert((job_id.clone(), 0i64), path.clone());
        let link = UnixSocketSupervisorLink::new(MapLookup(lookup));

        let received = Mutex::new(None);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let (mut conn, _) = listener.accept().unwrap();
                let cmd: SupervisorCommand = recv_framed(&mut conn).unwrap();
                *received.lock().unwrap() = Some(format!("{cmd:?}"));
                send_framed(&mut conn, &SupervisorReply::Ack).unwrap();
            });

            link.signal(&job_id, 0, 15).unwrap();
        });

        assert_eq!(received.lock().unwrap().as_deref(), Some("Signal(15)"));
    }
}
