// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node-local data model (spec §3): the records every other crate builds
//! against. None of these types know how to verify, persist, or transmit
//! themselves — that's `agentd-vault` and `agentd-wire`'s job, the same
//! split the teacher draws between `core::model` (plain data) and
//! `storage`/`wire` (behavior over that data).

use crate::ids::{JobId, NodeId, StepId};
use serde::{Deserialize, Serialize};

/// An authenticated capability binding (job, step, node, uid) together.
///
/// Created by the controller, verified by the vault, never mutated on the
/// node. A credential is valid only once `agentd-vault::verify` has checked
/// its signature, confirmed it isn't revoked, and confirmed the local
/// hostname is in its hostlist — this type alone makes no such guarantee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCredential {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    pub gid: u32,
    pub user_name: String,
    /// Hostnames (in cluster order) the step may run on.
    pub hostlist: Vec<String>,
    /// Packed per-node CPU bitmap, one entry per `hostlist` position.
    pub core_bitmap: CoreBitmap,
    pub memory_limit_mb: Option<u64>,
    pub x11_policy: X11Policy,
    pub supplementary_gids: Option<Vec<u32>>,
    /// Signature over the canonical encoding of every field above.
    pub signature: Vec<u8>,
}

/// X11-forwarding policy bits carried on a credential (spec §4.5: "apply
/// the X11-forwarding policy bits... to decide whether to resolve a
/// display for this node").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum X11Policy {
    Disabled,
    AllNodes,
    FirstNodeOnly,
}

/// Variable-sized RLE core bitmap (spec §9: "Model as a trait `NodeCoreView`
/// ... callers never touch the raw arrays").
///
/// `(sockets_per_node[], cores_per_socket[], sock_core_rep_count[], bitmap)`
/// — the same packed representation the controller hands down; this struct
/// only stores it, `NodeCoreView` is the access boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreBitmap {
    pub sockets_per_node: Vec<u32>,
    pub cores_per_socket: Vec<u32>,
    pub sock_core_rep_count: Vec<u32>,
    pub bitmap: Vec<u8>,
    pub threads_per_core: u32,
}

/// Read access to a packed core bitmap without exposing its RLE layout.
pub trait NodeCoreView {
    /// Total CPU count the *job* reserved on `host_index`.
    fn job_cpus_for_node(&self, host_index: usize) -> u32;
    /// Total CPU count this *step* reserved on `host_index` (subset of the
    /// job's allocation).
    fn step_cpus_for_node(&self, host_index: usize) -> u32;
}

impl NodeCoreView for CoreBitmap {
    fn job_cpus_for_node(&self, host_index: usize) -> u32 {
        self.cores_for_node(host_index) * self.threads_per_core
    }

    fn step_cpus_for_node(&self, host_index: usize) -> u32 {
        // The step view and job view share one packed representation on
        // the node side (the controller narrows the bitmap before sending
        // a step-scoped credential); kept distinct so callers can migrate
        // independently if that stops being true.
        self.cores_for_node(host_index) * self.threads_per_core
    }
}

impl CoreBitmap {
    fn cores_for_node(&self, host_index: usize) -> u32 {
        let mut bit_offset = 0usize;
        let mut rep_cursor = 0usize;
        for (node_idx, &sockets) in self.sockets_per_node.iter().enumerate() {
            let mut node_cores = 0u32;
            for _ in 0..sockets {
                let cores = self.cores_per_socket.get(rep_cursor).copied().unwrap_or(0);
                let reps = self.sock_core_rep_count.get(rep_cursor).copied().unwrap_or(1).max(1);
                node_cores += count_set_bits(&self.bitmap, bit_offset, cores as usize);
                bit_offset += cores as usize;
                rep_cursor += reps as usize;
            }
            if node_idx == host_index {
                return node_cores;
            }
        }
        0
    }
}

fn count_set_bits(bitmap: &[u8], start_bit: usize, len: usize) -> u32 {
    (start_bit..start_bit + len)
        .filter(|&bit| {
            let byte = bit / 8;
            let shift = bit % 8;
            bitmap.get(byte).map(|b| (b >> shift) & 1 == 1).unwrap_or(false)
        })
        .count() as u32
}

/// Per-job node-local lifecycle status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Credentialed,
    PrologRunning,
    Running,
    Completing,
    Completed,
}

/// Per-job node-local record. Created on first credential insert,
/// destroyed after epilog completes and the container is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub status: JobStatus,
    pub running_steps: u32,
    pub memory_limit_mb: Option<u64>,
    pub last_heartbeat_unix_secs: u64,
}

impl JobState {
    pub fn new(job_id: JobId, now_unix_secs: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Credentialed,
            running_steps: 0,
            memory_limit_mb: None,
            last_heartbeat_unix_secs: now_unix_secs,
        }
    }
}

/// Per-step node-local record. Lifetime equals the supervisor's lifetime;
/// rediscovered at agent startup by scanning the spool directory (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub job_id: JobId,
    pub step_id: StepId,
    /// This node's rank within the step's reverse tree, or `-1` if the
    /// step launched without a valid credential under privileged override
    /// (spec §4.5: "the step launches with rank = -1").
    pub node_rank: i32,
    pub supervisor_pid: u32,
    pub supervisor_socket_path: std::path::PathBuf,
    pub protocol_version: u32,
}

/// A revoked credential's expiry bookkeeping. Expires `cred_lifetime`
/// seconds after `revoke_time`; persisted atomically by the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationEntry {
    pub revoke_time_unix_secs: u64,
    pub start_time_unix_secs: u64,
    pub expiration_unix_secs: u64,
}

impl RevocationEntry {
    pub fn new(revoke_time_unix_secs: u64, start_time_unix_secs: u64, cred_lifetime_secs: u64) -> Self {
        Self {
            revoke_time_unix_secs,
            start_time_unix_secs,
            expiration_unix_secs: revoke_time_unix_secs + cred_lifetime_secs,
        }
    }

    pub fn is_expired(&self, now_unix_secs: u64) -> bool {
        now_unix_secs >= self.expiration_unix_secs
    }
}

/// The `NodeId` this node runs as, resolved once at startup (spec's Open
/// Question on `node_name`: kept opaque, never parsed as a DNS name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    pub id: NodeId,
    pub host_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_socket_bitmap(cores: u32, set_bits: u32, threads_per_core: u32) -> CoreBitmap {
        let mut bitmap = vec![0u8; 8];
        for bit in 0..set_bits as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        CoreBitmap {
            sockets_per_node: vec![1],
            cores_per_socket: vec![cores],
            sock_core_rep_count: vec![1],
            bitmap,
            threads_per_core,
        }
    }

    #[test]
    fn job_cpus_scale_by_threads_per_core() {
        let bitmap = single_socket_bitmap(8, 4, 2);
        assert_eq!(bitmap.job_cpus_for_node(0), 8);
    }

    #[test]
    fn node_out_of_range_returns_zero() {
        let bitmap = single_socket_bitmap(8, 4, 1);
        assert_eq!(bitmap.job_cpus_for_node(5), 0);
    }

    #[test]
    fn revocation_entry_expires_after_cred_lifetime() {
        let entry = RevocationEntry::new(1_000, 900, 300);
        assert!(!entry.is_expired(1_299));
        assert!(entry.is_expired(1_300));
    }

    #[test]
    fn job_state_starts_credentialed_with_no_running_steps() {
        let state = JobState::new(JobId::from("100"), 1_700_000_000);
        assert_eq!(state.status, JobStatus::Credentialed);
        assert_eq!(state.running_steps, 0);
    }
}
