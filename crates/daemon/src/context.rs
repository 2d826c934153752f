// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `AgentContext`: wires every other crate's primitives into the one
//! object the dispatcher, the uplink, and the spool scan all share (spec
//! §9 "AgentContext design note" — "one struct per node process, built
//! once at startup, handed to every worker thread by `Arc`").
//!
//! Mirrors the teacher's `ListenCtx` (`listener::ListenCtx`): a single
//! `Arc<AgentContext>` cloned into every spawned handler rather than a
//! global, so tests can build a second, independent context in-process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use agentd_adapters::{CgroupV2Adapter, ContainerAdapter, RoutingTree, StaticRoutingTree};
use agentd_bcast::{BcastReceiver, DestinationOpener, ForkingOpener};
use agentd_core::{AgentError, JobId, LocalNode, NodeId, StepId, StepKey, StepRecord, SystemClock};
use agentd_engine::{JobLifecycle, ProcessScriptRunner, ScriptRunner, StepLauncher, SupervisorLink};
use agentd_vault::Vault;
use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;

use crate::env::Config;
use crate::supervisor_link::{SocketLookup, UnixSocketSupervisorLink};
use parking_lot::Condvar;

/// One thing `crate::uplink` needs to tell the controller about, queued by
/// whichever dispatcher worker noticed it so the uplink thread is the only
/// one that ever dials out (spec §4.9).
pub enum UplinkEvent {
    /// A job's epilog has finished running; `host_index`/`host_count` feed
    /// `JobLifecycle::epilog_complete_delay` so a wide job's nodes don't all
    /// report in the same instant.
    EpilogComplete { job_id: JobId, rc: i32, host_index: u32, host_count: u32 },
    /// The step table changed shape (a launch or a step exit) — the uplink
    /// re-registers so the controller's view stays current (spec §4.9:
    /// "registration reports ... after any step table change").
    StepTableChanged,
}

/// Gate blocking a step launch until the controller's first registration
/// response has landed (spec §4.5 step 3(b): "if the vault has not yet
/// received the first registration response from the controller, the
/// launcher blocks on a condition variable until it has — this guarantees
/// the supervisor sees consistent accounting metadata"; spec §5: ordering
/// guarantee "Registration response happens-before any subsequent step
/// launch on the node").
pub struct TresGate {
    tres: Mutex<Option<Vec<String>>>,
    cv: Condvar,
}

impl Default for TresGate {
    fn default() -> Self {
        Self { tres: Mutex::new(None), cv: Condvar::new() }
    }
}

impl TresGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the controller's TRES list from its first `RegisterNode`
    /// reply and wakes every launcher blocked in `wait`.
    pub fn set(&self, tres: Vec<String>) {
        let mut guard = self.tres.lock();
        if guard.is_none() {
            *guard = Some(tres);
        }
        drop(guard);
        self.cv.notify_all();
    }

    /// Blocks until the controller's TRES list has been recorded, then
    /// returns a clone of it. Uninterruptible by design — there is no
    /// correct launch without it (spec's ordering guarantee).
    pub fn wait(&self) -> Vec<String> {
        let mut guard = self.tres.lock();
        while guard.is_none() {
            self.cv.wait(&mut guard);
        }
        guard.clone().unwrap_or_default()
    }

    pub fn get(&self) -> Option<Vec<String>> {
        self.tres.lock().clone()
    }
}

/// In-memory registry of steps this node is currently running, rebuilt at
/// startup by `crate::spool::scan` and mutated as steps launch and exit.
/// Also the daemon-local home for a step's owning uid: `agentd_core::model`
/// keeps `JobState` uid-free (the controller side never needed it), so this
/// is where the dispatcher's authorization rule looks it up instead (spec
/// §4.4 "uid == 0 or the configured controller uid or the job's owning
/// uid").
#[derive(Default)]
pub struct StepTable {
    steps: Mutex<HashMap<StepKey, StepRecord>>,
    job_owners: Mutex<HashMap<JobId, u32>>,
    job_meta: Mutex<HashMap<JobId, JobMeta>>,
}

/// The slice of a job's credential the termination/epilog path still needs
/// once the original RPC that carried it is long gone (spec §6's epilog
/// environment: `SLURM_JOB_USER`, `SLURM_NODELIST`, ...). Recorded at
/// credential-acceptance time, forgotten once the job's epilog has run.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub uid: u32,
    pub gid: u32,
    pub user_name: String,
    pub hostlist: Vec<String>,
}

impl StepTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_meta(&self, job_id: JobId, meta: JobMeta) {
        self.job_meta.lock().insert(job_id, meta);
    }

    pub fn meta(&self, job_id: &JobId) -> Option<JobMeta> {
        self.job_meta.lock().get(job_id).cloned()
    }

    pub fn forget_meta(&self, job_id: &JobId) {
        self.job_meta.lock().remove(job_id);
    }

    pub fn insert_step(&self, record: StepRecord) {
        let key = StepKey::new(record.job_id.clone(), record.step_id);
        self.steps.lock().insert(key, record);
    }

    pub fn remove_step(&self, job_id: &JobId, step_id: StepId) {
        self.steps.lock().remove(&StepKey::new(job_id.clone(), step_id));
    }

    pub fn step(&self, job_id: &JobId, step_id: StepId) -> Option<StepRecord> {
        self.steps.lock().get(&StepKey::new(job_id.clone(), step_id)).cloned()
    }

    pub fn steps_for_job(&self, job_id: &JobId) -> Vec<StepId> {
        self.steps.lock().keys().filter(|k| &k.job_id == job_id).map(|k| k.step_id).collect()
    }

    pub fn record_owner(&self, job_id: JobId, uid: u32) {
        self.job_owners.lock().insert(job_id, uid);
    }

    pub fn forget_owner(&self, job_id: &JobId) {
        self.job_owners.lock().remove(job_id);
    }

    pub fn owner(&self, job_id: &JobId) -> Option<u32> {
        self.job_owners.lock().get(job_id).copied()
    }

    pub fn active_job_count(&self) -> usize {
        self.job_owners.lock().len()
    }

    /// Every `(job, step)` pair currently tracked, for `RegisterNode`'s
    /// `running_steps` (spec §4.9).
    pub fn all_steps(&self) -> Vec<(JobId, StepId)> {
        self.steps.lock().keys().map(|k| (k.job_id.clone(), k.step_id)).collect()
    }
}

/// `SocketLookup` view of the step table, handed to
/// `UnixSocketSupervisorLink` so that crate stays ignorant of
/// `AgentContext`.
pub struct StepTableLookup(pub Arc<StepTable>);

impl SocketLookup for StepTableLookup {
    fn socket_path(&self, job_id: &JobId, step_id: StepId) -> Option<PathBuf> {
        self.0.step(job_id, step_id).map(|r| r.supervisor_socket_path)
    }
}

/// Everything the dispatcher, uplink, and spool scan need, built once at
/// startup and shared by `Arc` (spec §9 AgentContext design note).
pub struct AgentContext {
    pub config: Config,
    pub local_node: LocalNode,
    pub vault: Arc<Vault<SystemClock>>,
    pub lifecycle: Arc<JobLifecycle<SystemClock>>,
    pub launcher: StepLauncher,
    pub container: Arc<dyn ContainerAdapter>,
    pub routing: Arc<dyn RoutingTree>,
    pub script_runner: Arc<dyn ScriptRunner>,
    pub supervisor_link: Arc<dyn SupervisorLink>,
    pub bcast: Arc<BcastReceiver<SystemClock>>,
    pub steps: Arc<StepTable>,
    pub clock: SystemClock,
    /// Serializes `LaunchTasks`/`BatchJobLaunch` so two concurrent launches
    /// for the same step never race the prolog/launch_complete bookkeeping
    /// (spec §4.4: "a single process-wide launch mutex").
    pub launch_mutex: Mutex<()>,
    /// Held across every `nix::unistd::fork()` call this process makes —
    /// `StepLauncher::launch` and `agentd_bcast`'s privilege-drop opener
    /// both fork, and the spec's fork-safety discipline (§5) requires no
    /// other thread hold a lock a forked child might need, which in
    /// practice here just means not forking two children concurrently.
    pub fork_mutex: Mutex<()>,
    pub shutdown: AtomicBool,
    pub started_at: Instant,
    /// Set by `crate::uplink` once the controller's registration reply
    /// has landed; read by every step launch (spec §4.5/§4.9/§5).
    pub tres_gate: TresGate,
    /// Fed by the dispatcher's handlers, drained by `crate::uplink`'s
    /// background thread — the only place that dials the controller.
    pub uplink_tx: crossbeam_channel::Sender<UplinkEvent>,
    uplink_rx: Mutex<Option<crossbeam_channel::Receiver<UplinkEvent>>>,
}

impl AgentContext {
    pub fn build(config: Config) -> Result<Arc<Self>, AgentError> {
        let verifying_key = load_verifying_key(&config.cred_pubkey_path)?;
        let clock = SystemClock;

        let vault = Arc::new(Vault::new(verifying_key, config.node_name.clone(), config.vault_snapshot_path(), clock.clone()));
        vault.load().map_err(|e| AgentError::FatalConfig(format!("failed to load vault snapshot: {e}")))?;

        let lifecycle = Arc::new(JobLifecycle::new(vault.clone(), clock.clone(), config.kill_wait));
        let launcher = StepLauncher::new(config.supervisor_binary.clone());
        let container: Arc<dyn ContainerAdapter> = Arc::new(CgroupV2Adapter::new(config.cgroup_root.clone()));
        let routing: Arc<dyn RoutingTree> = Arc::new(StaticRoutingTree::new(config.tree_width));

        let script_runner: Arc<dyn ScriptRunner> = Arc::new(ProcessScriptRunner {
            prolog_path: config.prolog_path.clone().unwrap_or_else(|| PathBuf::from("/bin/true")),
            epilog_path: config.epilog_path.clone().unwrap_or_else(|| PathBuf::from("/bin/true")),
        });

        let steps = Arc::new(StepTable::new());
        let supervisor_link: Arc<dyn SupervisorLink> =
            Arc::new(UnixSocketSupervisorLink::new(StepTableLookup(steps.clone())));

        let opener: Arc<dyn DestinationOpener> = Arc::new(ForkingOpener::new(container.clone()));
        let bcast = Arc::new(BcastReceiver::new(opener, clock.clone()));

        let local_node = LocalNode { id: NodeId::from(config.node_name.as_str()), host_index: 0 };
        let (uplink_tx, uplink_rx) = crossbeam_channel::unbounded::<UplinkEvent>();

        Ok(Arc::new(Self {
            config,
            local_node,
            vault,
            lifecycle,
            launcher,
            container,
            routing,
            script_runner,
            supervisor_link,
            bcast,
            steps,
            clock,
            launch_mutex: Mutex::new(()),
            fork_mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            started_at: Instant::now(),
            tres_gate: TresGate::new(),
            uplink_tx,
            uplink_rx: Mutex::new(Some(uplink_rx)),
        }))
    }

    /// Hands the uplink thread its event receiver. Panics if called more
    /// than once — there is exactly one uplink thread per process.
    pub fn take_uplink_rx(&self) -> crossbeam_channel::Receiver<UplinkEvent> {
        self.uplink_rx.lock().take().expect("uplink receiver already taken")
    }

    /// uid==0, the configured controller uid, or the job's recorded owning
    /// uid (spec §4.4's authorization rule).
    pub fn authorize(&self, job_id: &JobId, claimed_uid: u32) -> Result<bool, AgentError> {
        if claimed_uid == 0 || claimed_uid == self.config.controller_uid {
            return Ok(true);
        }
        Ok(self.steps.owner(job_id) == Some(claimed_uid))
    }

    pub fn is_privileged(&self, claimed_uid: u32) -> bool {
        claimed_uid == 0 || claimed_uid == self.config.controller_uid
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Reads the controller's ed25519 verifying key from `path`: either 32 raw
/// bytes or their hex encoding (the controller-side signer tooling writes
/// either, depending on deployment — spec is silent on the exact on-disk
/// format, so both are accepted rather than picking one and breaking the
/// other).
pub fn load_verifying_key(path: &std::path::Path) -> Result<VerifyingKey, AgentError> {
    let bytes = std::fs::read(path).map_err(|e| AgentError::FatalConfig(format!("reading {}: {e}", path.display())))?;

    let raw: [u8; 32] = if bytes.len() == 32 {
        bytes.try_into().unwrap_or([0u8; 32])
    } else {
        let text = String::from_utf8_lossy(&bytes);
        let trimmed = text.trim();
        let decoded = hex_decode(trimmed)
            .ok_or_else(|| AgentError::FatalConfig(format!("{} is not a 32-byte key or its hex encoding", path.display())))?;
        if decoded.len() != 32 {
            return Err(AgentError::FatalConfig(format!("{} decoded to {} bytes, expected 32", path.display(), decoded.len())));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&decoded);
        out
    };

    VerifyingKey::from_bytes(&raw).map_err(|e| AgentError::FatalConfig(format!("invalid verifying key in {}: {e}", path.display())))
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_core::StepRecord;

    #[test]
    fn step_table_round_trips_owner_and_record() {
        let table = StepTable::new();
        let job_id = JobId::from("100");
        table.record_owner(job_id.clone(), 1001);
        assert_eq!(table.owner(&job_id), Some(1001));

        table.insert_step(StepRecord {
            job_id: job_id.clone(),
            step_id: 0,
            node_rank: 0,
            supervisor_pid: 4242,
            supervisor_socket_path: PathBuf::from("/tmp/sock"),
            protocol_version: 2,
        });
        assert_eq!(table.step(&job_id, 0).map(|r| r.supervisor_pid), Some(4242));
        assert_eq!(table.steps_for_job(&job_id), vec![0]);

        table.remove_step(&job_id, 0);
        assert!(table.step(&job_id, 0).is_none());
    }

    #[test]
    fn hex_verifying_key_round_trips() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[5u8; 32]);
        let verifying = signing.verifying_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubkey.hex");
        let hex: String = verifying.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        std::fs::write(&path, hex).unwrap();

        let loaded = load_verifying_key(&path).unwrap();
        assert_eq!(loaded.to_bytes(), verifying.to_bytes());
    }

    #[test]
    fn raw_verifying_key_round_trips() {
        let signing = ed25519_dalek::SigningKey::from_bytes(&[6u8; 32]);
        let verifying = signing.verifying_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pubkey.raw");
        std::fs::write(&path, verifying.to_bytes()).unwrap();

        let loaded = load_verifying_key(&path).unwrap();
        assert_eq!(loaded.to_bytes(), verifying.to_bytes());
    }
}
