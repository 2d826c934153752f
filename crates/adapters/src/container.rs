// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container join/create/delete trait boundary (spec §1: "Container
//! lifecycle management... delegated to an external collaborator via a
//! trait boundary, not a reimplementation").
//!
//! `agentd-engine`'s step launcher calls this trait between fork and exec
//! to place the new process in its step's resource container; it never
//! touches cgroup paths directly. Mirrors the adapter-trait split the
//! teacher draws in `adapters::agent` (`AgentAdapter` behind `LocalAdapter`/
//! `DockerAdapter`), but synchronous — there is no runtime to hand an
//! `async_trait` future to between `fork()` and `exec()`.

use agentd_core::{JobId, StepId};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container for {job_id}.{step_id} already exists")]
    AlreadyExists { job_id: JobId, step_id: StepId },

    #[error("container for {job_id}.{step_id} not found")]
    NotFound { job_id: JobId, step_id: StepId },
}

/// Resource limits a container is created with. Mirrors the subset of
/// `JobCredential` fields the step launcher has already resolved by the
/// time it calls `create` (spec §4.5: CPU count from the RLE bitmap,
/// optional memory limit).
#[derive(Debug, Clone, Copy)]
pub struct ContainerLimits {
    pub cpu_count: u32,
    pub memory_limit_mb: Option<u64>,
}

/// Joins the calling process (post-fork, pre-exec) into the step's
/// container, creating it on first use, and tears it down on step exit.
pub trait ContainerAdapter: Send + Sync {
    /// Creates the container for `(job_id, step_id)` with `limits`. Called
    /// once per step, before the first task forks.
    fn create(&self, job_id: &JobId, step_id: StepId, limits: ContainerLimits) -> Result<(), ContainerError>;

    /// Joins the *calling* process to the step's container. Called in the
    /// child immediately after `fork()`, before `exec()` — must not
    /// allocate in a way that risks deadlocking on a fork-inherited lock.
    fn join(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError>;

    /// Tears the container down. Called once the step's last task exits.
    fn delete(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError>;
}

/// Reference `ContainerAdapter` backed by cgroup v2 (`/sys/fs/cgroup`).
/// Creates one cgroup per step under a configurable parent, writes
/// `cpu.max`/`memory.max`, and joins by writing the pid to `cgroup.procs`.
pub struct CgroupV2Adapter {
    cgroup_root: PathBuf,
}

impl CgroupV2Adapter {
    pub fn new(cgroup_root: impl Into<PathBuf>) -> Self {
        Self { cgroup_root: cgroup_root.into() }
    }

    fn step_dir(&self, job_id: &JobId, step_id: StepId) -> PathBuf {
        self.cgroup_root.join(format!("agentd_{job_id}_{step_id}"))
    }
}

impl ContainerAdapter for CgroupV2Adapter {
    fn create(&self, job_id: &JobId, step_id: StepId, limits: ContainerLimits) -> Result<(), ContainerError> {
        let dir = self.step_dir(job_id, step_id);
        if dir.exists() {
            return Err(ContainerError::AlreadyExists { job_id: job_id.clone(), step_id });
        }
        std::fs::create_dir_all(&dir)?;

        // cpu.max takes "$MAX $PERIOD"; 100000us period is the kernel default.
        let period_us = 100_000u64;
        let quota_us = u64::from(limits.cpu_count) * period_us;
        std::fs::write(dir.join("cpu.max"), format!("{quota_us} {period_us}"))?;

        if let Some(mem_mb) = limits.memory_limit_mb {
            std::fs::write(dir.join("memory.max"), (mem_mb * 1024 * 1024).to_string())?;
        }

        Ok(())
    }

    fn join(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError> {
        let dir = self.step_dir(job_id, step_id);
        if !dir.exists() {
            return Err(ContainerError::NotFound { job_id: job_id.clone(), step_id });
        }
        let pid = std::process::id();
        std::fs::write(dir.join("cgroup.procs"), pid.to_string())?;
        Ok(())
    }

    fn delete(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError> {
        let dir = self.step_dir(job_id, step_id);
        if !dir.exists() {
            return Err(ContainerError::NotFound { job_id: job_id.clone(), step_id });
        }
        std::fs::remove_dir(&dir)?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// In-memory `ContainerAdapter` for tests: records calls instead of
    /// touching `/sys/fs/cgroup`.
    #[derive(Default)]
    pub struct FakeContainerAdapter {
        created: Mutex<HashSet<(JobId, StepId)>>,
    }

    impl FakeContainerAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn exists(&self, job_id: &JobId, step_id: StepId) -> bool {
            self.created.lock().contains(&(job_id.clone(), step_id))
        }
    }

    impl ContainerAdapter for FakeContainerAdapter {
        fn create(&self, job_id: &JobId, step_id: StepId, _limits: ContainerLimits) -> Result<(), ContainerError> {
            if !self.created.lock().insert((job_id.clone(), step_id)) {
                return Err(ContainerError::AlreadyExists { job_id: job_id.clone(), step_id });
            }
            Ok(())
        }

        fn join(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError> {
            if !self.created.lock().contains(&(job_id.clone(), step_id)) {
                return Err(ContainerError::NotFound { job_id: job_id.clone(), step_id });
            }
            Ok(())
        }

        fn delete(&self, job_id: &JobId, step_id: StepId) -> Result<(), ContainerError> {
            if !self.created.lock().remove(&(job_id.clone(), step_id)) {
                return Err(ContainerError::NotFound { job_id: job_id.clone(), step_id });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FakeContainerAdapter;
    use super::*;

    #[test]
    fn create_then_join_succeeds() {
        let adapter = FakeContainerAdapter::new();
        let job_id = JobId::from("100");
        adapter.create(&job_id, 0, ContainerLimits { cpu_count: 2, memory_limit_mb: None }).unwrap();
        adapter.join(&job_id, 0).unwrap();
    }

    #[test]
    fn join_before_create_is_not_found() {
        let adapter = FakeContainerAdapter::new();
        let job_id = JobId::from("100");
        let err = adapter.join(&job_id, 0).unwrap_err();
        assert!(matches!(err, ContainerError::NotFound { .. }));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let adapter = FakeContainerAdapter::new();
        let job_id = JobId::from("100");
        adapter.create(&job_id, 0, ContainerLimits { cpu_count: 1, memory_limit_mb: None }).unwrap();
        let err = adapter.create(&job_id, 0, ContainerLimits { cpu_count: 1, memory_limit_mb: None }).unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyExists { .. }));
    }
}
