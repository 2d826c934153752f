// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Spool directory scan (spec §3 `StepRecord`: "Discovered at agent
//! startup by scanning the spool directory"; spec §9: "All step state is
//! recoverable by re-scanning the spool directory and probing each
//! supervisor socket for liveness").
//!
//! Runs once, synchronously, before the dispatcher starts accepting: a
//! crashed-and-restarted agent has no other way to learn which supervisors
//! are still alive, since `agentd-vault`'s persisted `cred_state` is the
//! only state that survives a crash (spec §6 "Persisted state").

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use agentd_core::{JobId, StepId};

use crate::context::StepTable;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// One `<nodename>_<job>.<step>` entry found in the spool directory.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SpoolEntry {
    job_id: JobId,
    step_id: StepId,
    socket_path: std::path::PathBuf,
}

/// Parses a spool directory filename of the form `<nodename>_<job>.<step>`
/// against the configured node name. Anything else in the directory
/// (`cred_state*`, `job<id>/`) is silently ignored — this is a single
/// shared directory, not one this scan owns exclusively (spec §5: "the
/// spool directory is single-writer per (job_id, step_id) by OS filesystem
/// semantics; concurrent readers tolerate torn states").
fn parse_entry(node_name: &str, file_name: &str, path: &Path) -> Option<SpoolEntry> {
    let rest = file_name.strip_prefix(node_name)?.strip_prefix('_')?;
    let (job_part, step_part) = rest.split_once('.')?;
    if job_part.is_empty() {
        return None;
    }
    let step_id: StepId = step_part.parse().ok()?;
    Some(SpoolEntry { job_id: JobId::from(job_part), step_id, socket_path: path.to_path_buf() })
}

/// Connects to a supervisor's unix socket with a short timeout to decide
/// whether it is still alive. A missing or refused socket just means "step
/// gone" (spec §5) — not an error worth surfacing.
fn probe_alive(socket_path: &Path) -> bool {
    match UnixStream::connect(socket_path) {
        Ok(stream) => {
            let _ = stream.set_read_timeout(Some(PROBE_TIMEOUT));
            true
        }
        Err(_) => false,
    }
}

/// Scans `spool_dir` for supervisor sockets belonging to `node_name`,
/// probes each for liveness, and repopulates `steps` with the ones still
/// running. Stale sockets (no longer answering) are removed from disk so a
/// later `LaunchTasks` retry for the same `(job, step)` doesn't collide
/// with a dead file.
pub fn scan(spool_dir: &Path, node_name: &str, steps: &StepTable) -> std::io::Result<usize> {
    let mut recovered = 0usize;

    let entries = match std::fs::read_dir(spool_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else { continue };
        let Some(spool_entry) = parse_entry(node_name, file_name, &entry.path()) else { continue };

        if probe_alive(&spool_entry.socket_path) {
            steps.insert_step(agentd_core::StepRecord {
                job_id: spool_entry.job_id,
                step_id: spool_entry.step_id,
                node_rank: -1,
                supervisor_pid: 0,
                supervisor_socket_path: spool_entry.socket_path,
                protocol_version: agentd_wire::PROTOCOL_VERSION as u32,
            });
            recovered += 1;
        } else {
            let _ = std::fs::remove_file(&spool_entry.socket_path);
        }
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use tempfile::tempdir;

    #[test]
    fn parses_nodename_prefixed_socket_filenames() {
        let entry = parse_entry("n1", "n1_100.0", Path::new("/spool/n1_100.0")).unwrap();
        assert_eq!(entry.job_id, JobId::from("100"));
        assert_eq!(entry.step_id, 0);
    }

    #[test]
    fn ignores_files_not_matching_this_node() {
        assert!(parse_entry("n1", "n2_100.0", Path::new("/spool/n2_100.0")).is_none());
        assert!(parse_entry("n1", "cred_state", Path::new("/spool/cred_state")).is_none());
    }

    #[test]
    fn scan_recovers_live_sockets_and_removes_dead_ones() {
        let dir = tempdir().unwrap();
        let live_path = dir.path().join("n1_100.0");
        let _listener = UnixListener::bind(&live_path).unwrap();

        let dead_path = dir.path().join("n1_200.0");
        std::fs::write(&dead_path, b"").unwrap();

        let steps = StepTable::new();
        let recovered = scan(dir.path(), "n1", &steps).unwrap();

        assert_eq!(recovered, 1);
        assert!(steps.step(&JobId::from("100"), 0).is_some());
        assert!(steps.step(&JobId::from("200"), 0).is_none());
        assert!(!dead_path.exists());
    }

    #[test]
    fn missing_spool_dir_scans_as_empty() {
        let steps = StepTable::new();
        let recovered = scan(Path::new("/nonexistent/spool/dir"), "n1", &steps).unwrap();
        assert_eq!(recovered, 0);
    }
}
