// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup configuration (spec §1 ambient stack): everything the agent
//! needs before it can open its listening socket, loaded from `AGENTD_*`
//! environment variables, never a config file (non-goal).
//!
//! Mirrors the teacher's `daemon::lifecycle::Config`/`crate::env` split: one
//! module per crate that needs settings, defaults documented next to the
//! variable that provides them, a single `FatalConfigError` exit on any
//! missing required value (spec §7: "missing supervisor binary, bad spool
//! dir, unreadable public key" are all `FatalConfigError`).

use agentd_core::AgentError;
use std::path::PathBuf;
use std::time::Duration;

/// Worker-pool bound (spec §4.4: "Pool is bounded by MAX_THREADS (default
/// 256)").
const DEFAULT_MAX_THREADS: usize = 256;
/// `kill_wait` seconds between SIGTERM and SIGKILL in the terminate path
/// (spec §4.6).
const DEFAULT_KILL_WAIT_SECS: u64 = 30;
/// Reverse-tree / aggregation-tree fan-out width (spec §4.5/§4.9).
const DEFAULT_TREE_WIDTH: u32 = 16;
/// Aggregation window size; `1` disables aggregation (spec §4.9: "if
/// window_msgs > 1").
const DEFAULT_WINDOW_MSGS: u32 = 1;
const DEFAULT_WINDOW_TIME_MS: u64 = 200;

pub struct Config {
    pub node_name: String,
    pub cluster_name: String,
    pub spool_dir: PathBuf,
    pub socket_path: PathBuf,
    /// `host:port` of the controller uplink's listener (spec §4.9).
    pub controller_addr: String,
    pub supervisor_binary: PathBuf,
    pub prolog_path: Option<PathBuf>,
    pub epilog_path: Option<PathBuf>,
    pub cred_pubkey_path: PathBuf,
    pub slurm_conf_path: PathBuf,
    pub cgroup_root: PathBuf,
    pub controller_uid: u32,
    pub max_threads: usize,
    pub kill_wait: Duration,
    pub tree_width: u32,
    pub window_msgs: u32,
    pub window_time: Duration,
    pub debug_level: u8,
}

impl Config {
    /// Loads configuration from the process environment. Every field has a
    /// documented default except `node_name`, `spool_dir`,
    /// `cred_pubkey_path`, and `supervisor_binary`, which are required
    /// (spec §7 `FatalConfigError`: "missing supervisor binary, bad spool
    /// dir, unreadable public key").
    pub fn from_env() -> Result<Self, AgentError> {
        let node_name = required("AGENTD_NODE_NAME")?;
        let spool_dir = PathBuf::from(required("AGENTD_SPOOL_DIR")?);
        let supervisor_binary = PathBuf::from(required("AGENTD_SUPERVISOR_BINARY")?);
        let cred_pubkey_path = PathBuf::from(required("AGENTD_CRED_PUBKEY_PATH")?);

        if !cred_pubkey_path.exists() {
            return Err(AgentError::FatalConfig(format!("public key not found at {}", cred_pubkey_path.display())));
        }
        if !supervisor_binary.exists() {
            return Err(AgentError::FatalConfig(format!("supervisor binary not found at {}", supervisor_binary.display())));
        }

        Ok(Self {
            cluster_name: optional("AGENTD_CLUSTER_NAME", "default"),
            controller_addr: optional("AGENTD_CONTROLLER_ADDR", "127.0.0.1:6817"),
            socket_path: PathBuf::from(optional("AGENTD_SOCKET_PATH", "/run/agentd/agentd.sock")),
            prolog_path: optional_path("AGENTD_PROLOG_PATH"),
            epilog_path: optional_path("AGENTD_EPILOG_PATH"),
            slurm_conf_path: PathBuf::from(optional("AGENTD_SLURM_CONF", "/etc/slurm/slurm.conf")),
            cgroup_root: PathBuf::from(optional("AGENTD_CGROUP_ROOT", "/sys/fs/cgroup/agentd")),
            controller_uid: optional_parsed("AGENTD_CONTROLLER_UID", 0),
            max_threads: optional_parsed("AGENTD_MAX_THREADS", DEFAULT_MAX_THREADS),
            kill_wait: Duration::from_secs(optional_parsed("AGENTD_KILL_WAIT_SECS", DEFAULT_KILL_WAIT_SECS)),
            tree_width: optional_parsed("AGENTD_TREE_WIDTH", DEFAULT_TREE_WIDTH),
            window_msgs: optional_parsed("AGENTD_WINDOW_MSGS", DEFAULT_WINDOW_MSGS),
            window_time: Duration::from_millis(optional_parsed("AGENTD_WINDOW_TIME_MS", DEFAULT_WINDOW_TIME_MS)),
            debug_level: optional_parsed("AGENTD_DEBUG_LEVEL", 3u8),
            node_name,
            spool_dir,
            supervisor_binary,
            cred_pubkey_path,
        })
    }

    pub fn vault_snapshot_path(&self) -> PathBuf {
        self.spool_dir.join("cred_state")
    }

    /// Per-step supervisor socket path (spec §6 "Spool directory layout":
    /// `<spool>/<nodename>_<job>.<step>`).
    pub fn supervisor_socket_path(&self, job_id: &agentd_core::JobId, step_id: agentd_core::StepId) -> PathBuf {
        self.spool_dir.join(format!("{}_{}.{}", self.node_name, job_id, step_id))
    }

    pub fn batch_script_path(&self, job_id: &agentd_core::JobId) -> PathBuf {
        self.spool_dir.join(format!("job{job_id}")).join("slurm_script")
    }
}

fn required(key: &str) -> Result<String, AgentError> {
    std::env::var(key).map_err(|_| AgentError::FatalConfig(format!("{key} is not set")))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn optional_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn optional_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_agentd_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("AGENTD_") {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn missing_node_name_is_a_fatal_config_error() {
        clear_agentd_env();
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.kind(), agentd_core::ErrorKind::FatalConfigError);
    }

    #[test]
    #[serial]
    fn missing_pubkey_path_is_fatal() {
        clear_agentd_env();
        std::env::set_var("AGENTD_NODE_NAME", "n1");
        std::env::set_var("AGENTD_SPOOL_DIR", "/tmp");
        std::env::set_var("AGENTD_SUPERVISOR_BINARY", "/bin/true");
        std::env::set_var("AGENTD_CRED_PUBKEY_PATH", "/nonexistent/pubkey");
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.kind(), agentd_core::ErrorKind::FatalConfigError);
        clear_agentd_env();
    }

    #[test]
    #[serial]
    fn supervisor_socket_path_matches_spool_layout() {
        clear_agentd_env();
        std::env::set_var("AGENTD_NODE_NAME", "n1");
        std::env::set_var("AGENTD_SPOOL_DIR", "/var/spool/agentd");
        std::env::set_var("AGENTD_SUPERVISOR_BINARY", "/bin/true");
        std::env::set_var("AGENTD_CRED_PUBKEY_PATH", "/bin/true");
        let config = Config::from_env().expect("should load with required vars present");
        let path = config.supervisor_socket_path(&agentd_core::JobId::from("100"), 0);
        assert_eq!(path, PathBuf::from("/var/spool/agentd/n1_100.0"));
        clear_agentd_env();
    }
}
