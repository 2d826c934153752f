// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The job lifecycle driver (spec §4.6): launch-batch/launch-tasks prolog
//! discipline, signal/terminate, suspend/resume, and the epilog-complete
//! clock-spread. Supplemented from `req.c`'s `_rpc_terminate_job` /
//! `_epilog_complete` with a `TerminateReason` tag so `KillTimelimit` /
//! `KillPreempted` / an administrator `TerminateJob` share one state
//! machine but still report a distinct reason to the epilog environment.

use agentd_adapters::ContainerAdapter;
use agentd_core::{AgentError, Clock, JobId, StepId};
use agentd_vault::{Vault, WaiterSet};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Concurrent per-job suspend/resume operations in flight, cluster-wide
/// (spec §4.6: "Gated by a per-job spinlock slot (up to
/// NUM_PARALLEL_SUSP_JOBS = 64)").
pub const NUM_PARALLEL_SUSP_JOBS: usize = 64;
/// Supervisors suspended/resumed per batch within one job (spec §4.6).
pub const NUM_PARALLEL_SUSP_STEPS: usize = 8;
/// How long the suspend path waits for an in-flight launch to confirm
/// before giving up (spec §4.6: "waits on the `launch_complete` record for
/// up to 9 s, sleeping 1 s between polls").
pub const SUSPEND_STARTUP_WAIT: Duration = Duration::from_secs(9);
pub const SUSPEND_STARTUP_POLL: Duration = Duration::from_secs(1);
/// Node count at or below which the epilog-complete clock-spread is
/// skipped entirely (spec §4.6).
pub const EPILOG_SPREAD_SKIP_THRESHOLD: u32 = 64;
/// Capacity of the `launch_complete` LRU (spec §4.6: "a short LRU (64
/// entries)").
const LAUNCH_COMPLETE_CAPACITY: usize = 64;

const SIGCONT: i32 = 18;
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Why a job is being terminated — forwarded to the epilog environment as
/// `SLURM_JOB_KILL_REASON` so administrator scripts can distinguish a
/// time-limit kill from an administrator-initiated one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    KillTimelimit,
    KillPreempted,
    AdminTerminate,
}

impl TerminateReason {
    pub fn env_value(self) -> &'static str {
        match self {
            TerminateReason::KillTimelimit => "TIMELIMIT",
            TerminateReason::KillPreempted => "PREEMPTION",
            TerminateReason::AdminTerminate => "ADMIN",
        }
    }
}

/// Thin handle to a running step's supervisor, over whatever transport
/// `agentd`'s dispatcher uses to reach its unix socket. The lifecycle
/// driver never opens that socket itself.
pub trait SupervisorLink: Send + Sync {
    fn signal(&self, job_id: &JobId, step_id: StepId, signal: i32) -> Result<(), AgentError>;
    fn suspend(&self, job_id: &JobId, step_id: StepId, suspend: bool) -> Result<(), AgentError>;
    fn is_running(&self, job_id: &JobId, step_id: StepId) -> bool;
}

/// Runs the external prolog/epilog scripts with a populated environment
/// (spec §6). A reference implementation shells out via `std::process`;
/// tests substitute a fake that records calls.
pub trait ScriptRunner: Send + Sync {
    fn run_prolog(&self, env: &HashMap<String, String>) -> std::io::Result<i32>;
    fn run_epilog(&self, env: &HashMap<String, String>) -> std::io::Result<i32>;
}

/// Reference `ScriptRunner`: invokes configured script paths as child
/// processes, passing `env` as the child's environment.
pub struct ProcessScriptRunner {
    pub prolog_path: std::path::PathBuf,
    pub epilog_path: std::path::PathBuf,
}

impl ScriptRunner for ProcessScriptRunner {
    fn run_prolog(&self, env: &HashMap<String, String>) -> std::io::Result<i32> {
        run_script(&self.prolog_path, env)
    }

    fn run_epilog(&self, env: &HashMap<String, String>) -> std::io::Result<i32> {
        run_script(&self.epilog_path, env)
    }
}

fn run_script(path: &std::path::Path, env: &HashMap<String, String>) -> std::io::Result<i32> {
    let status = std::process::Command::new(path).env_clear().envs(env.iter()).status()?;
    Ok(status.code().unwrap_or(-1))
}

/// A small bounded set recording which `(job_id, step_id)` pairs have
/// recently confirmed launch, so a concurrent suspend can wait on one
/// rather than racing the fork/exec.
struct LaunchCompleteLru {
    order: VecDeque<(JobId, StepId)>,
    present: std::collections::HashSet<(JobId, StepId)>,
}

impl LaunchCompleteLru {
    fn new() -> Self {
        Self { order: VecDeque::new(), present: std::collections::HashSet::new() }
    }

    fn record(&mut self, key: (JobId, StepId)) {
        if self.present.insert(key.clone()) {
            self.order.push_back(key);
            if self.order.len() > LAUNCH_COMPLETE_CAPACITY {
                if let Some(evicted) = self.order.pop_front() {
                    self.present.remove(&evicted);
                }
            }
        }
    }

    fn contains(&self, key: &(JobId, StepId)) -> bool {
        self.present.contains(key)
    }
}

/// Counting gate bounding concurrent suspend/resume operations cluster-wide
/// to `NUM_PARALLEL_SUSP_JOBS`.
struct SuspendSlots {
    available: Mutex<usize>,
    cv: Condvar,
}

impl SuspendSlots {
    fn new(capacity: usize) -> Self {
        Self { available: Mutex::new(capacity), cv: Condvar::new() }
    }

    fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.cv.wait(&mut available);
        }
        *available -= 1;
    }

    fn release(&self) {
        let mut available = self.available.lock();
        *available += 1;
        drop(available);
        self.cv.notify_one();
    }
}

pub struct JobLifecycle<C: Clock> {
    vault: Arc<Vault<C>>,
    terminator_waiters: Arc<WaiterSet<JobId>>,
    starting_step_waiters: Arc<WaiterSet<(JobId, StepId)>>,
    prolog_running: Arc<WaiterSet<JobId>>,
    launch_complete: Mutex<LaunchCompleteLru>,
    suspend_slots: SuspendSlots,
    clock: C,
    kill_wait: Duration,
}

impl<C: Clock> JobLifecycle<C> {
    pub fn new(vault: Arc<Vault<C>>, clock: C, kill_wait: Duration) -> Self {
        Self {
            vault,
            terminator_waiters: Arc::new(WaiterSet::new()),
            starting_step_waiters: Arc::new(WaiterSet::new()),
            prolog_running: Arc::new(WaiterSet::new()),
            launch_complete: Mutex::new(LaunchCompleteLru::new()),
            suspend_slots: SuspendSlots::new(NUM_PARALLEL_SUSP_JOBS),
            clock,
            kill_wait,
        }
    }

    /// Runs the prolog for `job_id` if no other thread is already running
    /// one for it, then returns its exit code. Callers running concurrent
    /// launches for the same job block here until the first prolog
    /// finishes, matching spec §4.3's "Prolog-running set".
    pub fn ensure_prolog(&self, job_id: &JobId, runner: &dyn ScriptRunner, env: &HashMap<String, String>) -> std::io::Result<i32> {
        if self.prolog_running.insert_if_absent(job_id.clone()) {
            let rc = runner.run_prolog(env);
            self.prolog_running.remove_and_broadcast(job_id);
            rc
        } else {
            self.prolog_running.wait_until_absent(job_id, Duration::from_secs(300));
            Ok(0)
        }
    }

    /// Launch-batch path (spec §4.6): the caller has already validated the
    /// sender is privileged and inserted the credential; this method only
    /// owns the prolog discipline and `launch_complete` bookkeeping, the
    /// actual fork/exec is `engine::launcher::StepLauncher`.
    pub fn mark_launch_complete(&self, job_id: &JobId, step_id: StepId) {
        self.launch_complete.lock().record((job_id.clone(), step_id));
    }

    pub fn is_launch_complete(&self, job_id: &JobId, step_id: StepId) -> bool {
        self.launch_complete.lock().contains(&(job_id.clone(), step_id))
    }

    /// Registers that a step is starting (between the dispatcher's accept
    /// and the supervisor's confirmation-of-listening). A `TerminateJob`
    /// for the same step blocks on this barrier. Returns `false` if the
    /// step was already starting — the dispatcher reuses this to debounce a
    /// retried `LaunchTasks`/`BatchJobLaunch` for the same step (spec.md §4.4
    /// supplemented from the original's `_waiter_complete` dance).
    pub fn begin_step_start(&self, job_id: &JobId, step_id: StepId) -> bool {
        self.starting_step_waiters.insert_if_absent((job_id.clone(), step_id))
    }

    pub fn end_step_start(&self, job_id: &JobId, step_id: StepId) {
        self.starting_step_waiters.remove_and_broadcast(&(job_id.clone(), step_id));
    }

    /// `TerminateJob`/`KillTimelimit`/`KillPreempted` (spec §4.6): revoke
    /// the credential, wait for any in-flight prolog and starting-step
    /// barrier, escalate SIGCONT→SIGTERM→SIGKILL, delete the container,
    /// run the epilog, and report completion. A second concurrent
    /// terminate for the same job returns immediately without re-running
    /// the epilog.
    pub fn terminate_job(
        &self,
        job_id: &JobId,
        reason: TerminateReason,
        steps: &[StepId],
        supervisor: &dyn SupervisorLink,
        container: &dyn ContainerAdapter,
        runner: &dyn ScriptRunner,
        mut epilog_env: HashMap<String, String>,
    ) -> Result<i32, AgentError> {
        if !self.terminator_waiters.insert_if_absent(job_id.clone()) {
            return Ok(0);
        }

        let now = self.clock.unix_secs();
        self.vault.revoke(job_id.clone(), now, now);

        self.prolog_running.wait_until_absent(job_id, Duration::from_secs(300));
        for &step_id in steps {
            self.starting_step_waiters.wait_until_absent(&(job_id.clone(), step_id), Duration::from_secs(300));
        }

        for &step_id in steps {
            let _ = supervisor.signal(job_id, step_id, SIGCONT);
        }

        let already_suspended = steps.iter().all(|&s| !supervisor.is_running(job_id, s));
        if already_suspended {
            for &step_id in steps {
                let _ = supervisor.signal(job_id, step_id, SIGKILL);
            }
        } else {
            for &step_id in steps {
                let _ = supervisor.signal(job_id, step_id, SIGTERM);
            }
            std::thread::sleep(self.kill_wait);
            for &step_id in steps {
                let _ = supervisor.signal(job_id, step_id, SIGKILL);
                let _ = container.delete(job_id, step_id);
            }
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while steps.iter().any(|&s| supervisor.is_running(job_id, s)) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        epilog_env.insert("SLURM_JOB_KILL_REASON".to_string(), reason.env_value().to_string());
        let rc = runner.run_epilog(&epilog_env)?;

        self.terminator_waiters.remove_and_broadcast(job_id);
        Ok(rc)
    }

    /// Suspend/resume (spec §4.6): bounded by the cluster-wide
    /// `NUM_PARALLEL_SUSP_JOBS` gate, waits up to 9s (polling every 1s) for
    /// an unconfirmed launch, and issues the RPC to supervisors in
    /// parallel batches of `NUM_PARALLEL_SUSP_STEPS`.
    pub fn suspend_resume(&self, job_id: &JobId, steps: &[StepId], suspend: bool, supervisor: &dyn SupervisorLink) {
        self.suspend_slots.acquire();

        for &step_id in steps {
            if !self.is_launch_complete(job_id, step_id) {
                let waited = Instant::now();
                while !self.is_launch_complete(job_id, step_id) && waited.elapsed() < SUSPEND_STARTUP_WAIT {
                    std::thread::sleep(SUSPEND_STARTUP_POLL);
                }
            }
        }

        for batch in steps.chunks(NUM_PARALLEL_SUSP_STEPS) {
            std::thread::scope(|scope| {
                for &step_id in batch {
                    scope.spawn(move || {
                        let _ = supervisor.suspend(job_id, step_id, suspend);
                    });
                }
            });
        }

        self.suspend_slots.release();
    }

    /// Epilog-complete clock-spread (spec §4.6): delays the completion RPC
    /// by `host_index * epilog_msg_time mod total_expected` to avoid
    /// synchronous storms, skipped for small clusters.
    pub fn epilog_complete_delay(&self, host_index: u32, host_count: u32, epilog_msg_time: Duration, total_expected: Duration) -> Duration {
        if host_count <= EPILOG_SPREAD_SKIP_THRESHOLD || total_expected.is_zero() {
            return Duration::ZERO;
        }
        let offset_micros = u128::from(host_index) * epilog_msg_time.as_micros();
        let spread_micros = offset_micros % total_expected.as_micros().max(1);
        Duration::from_micros(spread_micros.min(u128::from(u64::MAX)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_core::FakeClock;
    use parking_lot::Mutex as PLMutex;
    use std::collections::HashSet;

    struct FakeSupervisor {
        signals: PLMutex<Vec<(JobId, StepId, i32)>>,
        running: PLMutex<HashSet<(JobId, StepId)>>,
    }

    impl FakeSupervisor {
        fn new(running_steps: &[(JobId, StepId)]) -> Self {
            Self { signals: PLMutex::new(Vec::new()), running: PLMutex::new(running_steps.iter().cloned().collect()) }
        }
    }

    impl SupervisorLink for FakeSupervisor {
        fn signal(&self, job_id: &JobId, step_id: StepId, signal: i32) -> Result<(), AgentError> {
            self.signals.lock().push((job_id.clone(), step_id, signal));
            if signal == SIGKILL {
                self.running.lock().remove(&(job_id.clone(), step_id));
            }
            Ok(())
        }

        fn suspend(&self, _job_id: &JobId, _step_id: StepId, _suspend: bool) -> Result<(), AgentError> {
            Ok(())
        }

        fn is_running(&self, job_id: &JobId, step_id: StepId) -> bool {
            self.running.lock().contains(&(job_id.clone(), step_id))
        }
    }

    struct FakeScriptRunner {
        prolog_rc: i32,
        epilog_rc: i32,
    }

    impl ScriptRunner for FakeScriptRunner {
        fn run_prolog(&self, _env: &HashMap<String, String>) -> std::io::Result<i32> {
            Ok(self.prolog_rc)
        }

        fn run_epilog(&self, _env: &HashMap<String, String>) -> std::io::Result<i32> {
            Ok(self.epilog_rc)
        }
    }

    fn lifecycle() -> JobLifecycle<FakeClock> {
        let vault = Arc::new(agentd_vault::Vault::new(
            ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]).verifying_key(),
            "n1",
            std::env::temp_dir().join(format!("agentd-test-{}", nanoid::nanoid!())),
            FakeClock::new(),
        ));
        JobLifecycle::new(vault, FakeClock::new(), Duration::from_millis(10))
    }

    #[test]
    fn concurrent_terminate_for_same_job_is_a_no_op_second_time() {
        let lc = lifecycle();
        let job_id = JobId::from("100");
        assert!(lc.terminator_waiters.insert_if_absent(job_id.clone()));
        assert!(!lc.terminator_waiters.insert_if_absent(job_id));
    }

    #[test]
    fn terminate_job_runs_epilog_and_reports_its_rc() {
        let lc = lifecycle();
        let job_id = JobId::from("100");
        let supervisor = FakeSupervisor::new(&[(job_id.clone(), 0)]);
        let container = agentd_adapters::FakeContainerAdapter::new();
        container.create(&job_id, 0, agentd_adapters::ContainerLimits { cpu_count: 1, memory_limit_mb: None }).unwrap();
        let runner = FakeScriptRunner { prolog_rc: 0, epilog_rc: 7 };

        let rc = lc
            .terminate_job(&job_id, TerminateReason::AdminTerminate, &[0], &supervisor, &container, &runner, HashMap::new())
            .unwrap();

        assert_eq!(rc, 7);
        assert!(supervisor.signals.lock().iter().any(|(_, _, sig)| *sig == SIGKILL));
    }

    #[test]
    fn epilog_spread_is_skipped_for_small_clusters() {
        let lc = lifecycle();
        let delay = lc.epilog_complete_delay(10, 32, Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn epilog_spread_scales_with_host_index_for_large_clusters() {
        let lc = lifecycle();
        let d0 = lc.epilog_complete_delay(0, 200, Duration::from_millis(5), Duration::from_secs(1));
        let d10 = lc.epilog_complete_delay(10, 200, Duration::from_millis(5), Duration::from_secs(1));
        assert_eq!(d0, Duration::ZERO);
        assert!(d10 > Duration::ZERO);
    }

    #[test]
    fn launch_complete_lru_evicts_oldest_past_capacity() {
        let mut lru = LaunchCompleteLru::new();
        for i in 0..LAUNCH_COMPLETE_CAPACITY + 1 {
            lru.record((JobId::from(i.to_string()), 0));
        }
        assert!(!lru.contains(&(JobId::from("0"), 0)));
        assert!(lru.contains(&(JobId::from(LAUNCH_COMPLETE_CAPACITY.to_string()), 0)));
    }
}
