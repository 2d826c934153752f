// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builders shared by every crate's test suite, gated behind `test-support`
//! the same way the teacher's `core::testing` module backs `oj-core`'s
//! downstream test crates.

use crate::ids::{JobId, NodeId, StepId};
use crate::model::{CoreBitmap, JobCredential, X11Policy};

/// A `JobCredential` builder with sane defaults for one job/step/node,
/// fluent-mutable so tests only override what they care about.
pub struct CredentialBuilder {
    credential: JobCredential,
}

impl CredentialBuilder {
    pub fn new(job_id: impl Into<JobId>, step_id: StepId) -> Self {
        Self {
            credential: JobCredential {
                job_id: job_id.into(),
                step_id,
                uid: 1001,
                gid: 1001,
                user_name: "testuser".to_string(),
                hostlist: vec!["n1".to_string()],
                core_bitmap: single_node_bitmap(1, 1),
                memory_limit_mb: None,
                x11_policy: X11Policy::Disabled,
                supplementary_gids: None,
                signature: Vec::new(),
            },
        }
    }

    pub fn hostlist(mut self, hosts: &[&str]) -> Self {
        self.credential.hostlist = hosts.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.credential.uid = uid;
        self
    }

    pub fn signature(mut self, bytes: Vec<u8>) -> Self {
        self.credential.signature = bytes;
        self
    }

    pub fn build(self) -> JobCredential {
        self.credential
    }
}

/// A single socket, `cores` cores all allocated, one thread per core.
pub fn single_node_bitmap(cores: u32, nodes: u32) -> CoreBitmap {
    let bytes_needed = (cores as usize).div_ceil(8).max(1);
    CoreBitmap {
        sockets_per_node: vec![1; nodes as usize],
        cores_per_socket: vec![cores; nodes as usize],
        sock_core_rep_count: vec![1; nodes as usize],
        bitmap: vec![0xFF; bytes_needed * nodes as usize],
        threads_per_core: 1,
    }
}

pub fn node_id(name: &str) -> NodeId {
    NodeId::from(name)
}
