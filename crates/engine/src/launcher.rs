// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The step launcher (spec §4.5): a double-fork handoff to a detached
//! step-supervisor process, marshalling the supervisor's startup envelope
//! over a pair of pipes in the exact order the original daemon writes it.
//!
//! This is the one place in the workspace where `unsafe` is unavoidable —
//! `fork()` in a process that may have other threads live is inherently
//! unsafe, which is why `agentd-engine` carries its own lint override
//! instead of the workspace's blanket `unsafe_code = "forbid"`.

use agentd_adapters::{ContainerAdapter, ContainerLimits};
use agentd_core::reverse_tree;
use agentd_core::{JobId, StepId};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, fork, pipe, setsid, ForkResult, Pid};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Logged (not failed) when the supervisor round-trip takes longer than
/// this (spec §4.5 step 4: "a startup-time warning if the round-trip
/// exceeded 5 s").
pub const STARTUP_WARN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("I/O error during handoff: {0}")]
    Io(#[from] std::io::Error),

    #[error("fork failed: {0}")]
    Fork(#[from] nix::Error),

    #[error("supervisor reported non-zero startup rc {0}")]
    SupervisorStartupFailed(i32),

    #[error("container setup failed: {0}")]
    Container(#[from] agentd_adapters::ContainerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchKind {
    LaunchTasks,
    LaunchBatch,
}

use serde::{Deserialize, Serialize};

/// This node's reverse-tree parameters for one step (spec §4.5: "given
/// node rank r and step size n with fan-out W..."). A NULL hostset
/// (batch job, or an unverified launch accepted only because the caller
/// was privileged) collapses every field to its sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeParams {
    pub rank: i32,
    pub parent_rank: i32,
    pub children: u32,
    pub depth: u32,
    pub max_depth: u32,
}

impl TreeParams {
    pub const NULL: TreeParams = TreeParams { rank: -1, parent_rank: -1, children: 0, depth: 0, max_depth: 0 };
}

/// Computes this node's tree params from its rank, the step size, and the
/// fan-out width. `step_size == 0` (NULL hostset) yields `TreeParams::NULL`.
pub fn compute_tree_params(rank: u32, step_size: u32, fan_out: u32) -> TreeParams {
    if step_size == 0 {
        return TreeParams::NULL;
    }
    let pos = reverse_tree::position(rank, step_size, fan_out);
    let depth = reverse_tree::depth(rank, fan_out);
    let max_depth = (0..step_size).map(|r| reverse_tree::depth(r, fan_out)).max().unwrap_or(0);

    TreeParams {
        rank: rank as i32,
        parent_rank: pos.parent.map(|p| p as i32).unwrap_or(-1),
        children: pos.children.len() as u32,
        depth,
        max_depth,
    }
}

/// Sections (a)-(m) of the supervisor startup envelope, marshalled over
/// `to_stepd` in this exact order (spec §4.5 step 3). Each section is
/// written length-prefixed JSON rather than the original's packed binary
/// structs — the ordering invariant is what the supervisor protocol
/// actually depends on, not the byte encoding of any one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchEnvelope {
    /// (a) node name, spool dir, plugin params, debug level, cluster name.
    pub agent_config: AgentConfigSection,
    /// (b) TRES accounting list, synchronized against the vault's first
    /// registration response (the caller blocks before constructing this).
    pub tres: Vec<String>,
    /// (c) cgroup configuration.
    pub cgroup: ContainerLimits,
    /// (d) accounting-gather configuration.
    pub acct_gather: AcctGatherSection,
    /// (e) launch-kind tag.
    pub kind: LaunchKind,
    /// (f) reverse-tree parameters for this node's rank.
    pub tree: TreeParams,
    /// (g) packed client address.
    pub client_addr: String,
    /// (h) packed self address.
    pub self_addr: String,
    /// (i) packed GRES state.
    pub gres: Vec<String>,
    /// (j) packed CPU-frequency state.
    pub cpu_freq: Option<String>,
    /// (k) packed original RPC payload.
    pub original_rpc: Vec<u8>,
    /// (l) client protocol version.
    pub client_protocol_version: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfigSection {
    pub node_name: String,
    pub spool_dir: String,
    pub plugin_params: Vec<String>,
    pub debug_level: u8,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcctGatherSection {
    pub energy_plugin: Option<String>,
    pub filesystem_plugin: Option<String>,
    pub interconnect_plugin: Option<String>,
}

/// Outcome of a launch attempt, sent back from the grandchild over
/// `to_slurmd` as the 4-byte rc, then interpreted here as this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    Ready { rank: i32, children: u32 },
    Failed(i32),
}

pub struct StepLauncher {
    supervisor_binary: PathBuf,
}

impl StepLauncher {
    pub fn new(supervisor_binary: impl Into<PathBuf>) -> Self {
        Self { supervisor_binary: supervisor_binary.into() }
    }

    /// Runs the full double-fork handoff (spec §4.5 steps 1-6) and returns
    /// the supervisor's reported outcome.
    ///
    /// # Safety discipline
    /// `fork()` only calls async-signal-safe functions before `exec` in the
    /// grandchild, per the spec's fork-safety requirement (§4.4/§5); no
    /// allocation or lock acquisition happens between `fork` and `exec`
    /// besides what `nix`'s thin wrappers themselves need.
    pub fn launch(
        &self,
        envelope: &LaunchEnvelope,
        container: &dyn ContainerAdapter,
        job_id: &JobId,
        step_id: StepId,
    ) -> Result<Handoff, LaunchError> {
        container.create(job_id, step_id, envelope.cgroup)?;

        let (to_stepd_read, to_stepd_write) = pipe()?;
        let (to_slurmd_read, to_slurmd_write) = pipe()?;

        let started_at = Instant::now();

        // SAFETY: the child path below only calls setsid/dup2/close/exec
        // before replacing its image; no Rust-level locks are taken.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => {
                drop(to_stepd_read);
                drop(to_slurmd_write);
                self.parent_side(child, to_stepd_write, to_slurmd_read, envelope, started_at)
            }
            ForkResult::Child => {
                drop(to_stepd_write);
                drop(to_slurmd_read);
                match unsafe { fork() } {
                    Ok(ForkResult::Parent { .. }) => {
                        // Intermediate child: exit immediately so the
                        // grandchild is reparented to init (spec step 1).
                        std::process::exit(0);
                    }
                    Ok(ForkResult::Child) => {
                        self.grandchild_side(to_stepd_read, to_slurmd_write, container, job_id, step_id);
                        // grandchild_side never returns (it execs or exits).
                        unreachable!("grandchild_side must exec or exit");
                    }
                    Err(_) => std::process::exit(1),
                }
            }
        }
    }

    fn parent_side(
        &self,
        intermediate_child: Pid,
        to_stepd_write: OwnedFd,
        to_slurmd_read: OwnedFd,
        envelope: &LaunchEnvelope,
        started_at: Instant,
    ) -> Result<Handoff, LaunchError> {
        // Step 3: marshal sections (a)-(k) as length-prefixed JSON, in order.
        write_section(&to_stepd_write, &envelope.agent_config)?;
        write_section(&to_stepd_write, &envelope.tres)?;
        write_section(&to_stepd_write, &envelope.cgroup)?;
        write_section(&to_stepd_write, &envelope.acct_gather)?;
        write_section(&to_stepd_write, &envelope.kind)?;
        write_section(&to_stepd_write, &envelope.tree)?;
        write_section(&to_stepd_write, &envelope.client_addr)?;
        write_section(&to_stepd_write, &envelope.self_addr)?;
        write_section(&to_stepd_write, &envelope.gres)?;
        write_section(&to_stepd_write, &envelope.cpu_freq)?;
        write_section(&to_stepd_write, &envelope.original_rpc)?;
        // (l) client protocol version, u16 big-endian (not length-prefixed
        // JSON: this field alone is a fixed two-byte scalar on the wire).
        write_raw(&to_stepd_write, &envelope.client_protocol_version.to_be_bytes())?;
        // (m) length-prefixed final marshalled RPC bytes.
        write_section(&to_stepd_write, &envelope.original_rpc)?;

        // Step 4: read the 4-byte rc.
        let mut rc_buf = [0u8; 4];
        let mut reader = std::fs::File::from(to_slurmd_read);
        reader.read_exact(&mut rc_buf)?;
        let rc = i32::from_be_bytes(rc_buf);

        if started_at.elapsed() > STARTUP_WARN {
            tracing::warn!(elapsed_ms = started_at.elapsed().as_millis() as u64, "supervisor startup round-trip exceeded 5s");
        }

        // Step 5: write a 4-byte ack back.
        let mut writer = std::fs::File::from(to_stepd_write);
        writer.write_all(&0i32.to_be_bytes())?;
        writer.flush()?;

        // Step 6: waitpid the intermediate child, not the grandchild.
        match waitpid(intermediate_child, None) {
            Ok(WaitStatus::Exited(_, _)) | Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "waitpid on intermediate child failed"),
        }

        if rc != 0 {
            return Ok(Handoff::Failed(rc));
        }

        Ok(Handoff::Ready { rank: envelope.tree.rank, children: envelope.tree.children })
    }

    fn grandchild_side(
        &self,
        to_stepd_read: OwnedFd,
        to_slurmd_write: OwnedFd,
        container: &dyn ContainerAdapter,
        job_id: &JobId,
        step_id: StepId,
    ) {
        // Step 2: setsid, dup2 the pipe ends onto stdin/stdout, silence
        // stderr, close everything else, then exec. Any failure here exits
        // non-zero rather than returning (there is no caller left to
        // propagate a `Result` to once we've forked twice).
        if setsid().is_err() {
            std::process::exit(1);
        }
        if container.join(job_id, step_id).is_err() {
            std::process::exit(1);
        }

        let stepd_fd: RawFd = to_stepd_read.as_raw_fd();
        let slurmd_fd: RawFd = to_slurmd_write.as_raw_fd();
        if dup2(stepd_fd, 0).is_err() || dup2(slurmd_fd, 1).is_err() {
            std::process::exit(1);
        }
        if let Ok(devnull) = nix::fcntl::open("/dev/null", nix::fcntl::OFlag::O_WRONLY, nix::sys::stat::Mode::empty()) {
            let _ = dup2(devnull.as_raw_fd(), 2);
        }

        let err = Command::new(&self.supervisor_binary).exec();
        tracing::error!(error = %err, "exec of supervisor binary failed");
        std::process::exit(1);
    }
}

fn write_section<T: Serialize>(fd: &OwnedFd, value: &T) -> Result<(), LaunchError> {
    let bytes = serde_json::to_vec(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = (bytes.len() as u32).to_be_bytes();
    write_raw(fd, &len)?;
    write_raw(fd, &bytes)
}

fn write_raw(fd: &OwnedFd, bytes: &[u8]) -> Result<(), LaunchError> {
    let mut file = std::fs::File::from(fd.try_clone()?);
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_hostset_yields_sentinel_params() {
        let params = compute_tree_params(0, 0, 16);
        assert_eq!(params, TreeParams::NULL);
    }

    #[test]
    fn rank_zero_has_no_parent() {
        let params = compute_tree_params(0, 10, 3);
        assert_eq!(params.parent_rank, -1);
        assert_eq!(params.rank, 0);
    }

    #[test]
    fn middle_rank_has_both_parent_and_children() {
        let params = compute_tree_params(1, 10, 3);
        assert_eq!(params.parent_rank, 0);
        assert!(params.children > 0);
    }

    #[test]
    fn leaf_rank_has_no_children() {
        let params = compute_tree_params(9, 10, 3);
        assert_eq!(params.children, 0);
    }

    #[test]
    fn depth_increases_moving_away_from_root() {
        let root = compute_tree_params(0, 10, 3);
        let leaf = compute_tree_params(9, 10, 3);
        assert!(leaf.depth > root.depth);
        assert_eq!(root.depth, 0);
    }
}
