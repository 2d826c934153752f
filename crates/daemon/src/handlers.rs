// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One function per `Request` variant (spec §6), the same split the
//! teacher draws across `listener::{mutations, query, workers, crons}` —
//! `dispatcher::handle_request`'s match arm for each kind just calls
//! straight into one of these rather than inlining the logic.

use std::collections::HashMap;
use std::sync::Arc;

use agentd_core::{AgentError, Clock, JobId, JobState, JobStatus, StepId, StepRecord, BATCH_STEP_ID};
use agentd_engine::{compute_tree_params, AcctGatherSection, AgentConfigSection, Handoff, LaunchEnvelope, LaunchKind, TerminateReason};
use agentd_vault::VerifiedCredential;
use agentd_wire::{Request, Response, StepCompleteEntry};

use crate::context::{AgentContext, JobMeta, UplinkEvent};

/// Builds the prolog/epilog environment common to every script invocation
/// (spec §6): the fields the simplified wire protocol still carries.
/// `SLURM_JOB_PARTITION`, `SPANK_*`, and GRES variables are omitted — the
/// credential this agent receives doesn't carry partition or SPANK state,
/// unlike the original daemon's richer launch RPC.
fn base_script_env(ctx: &AgentContext, job_id: &JobId, meta: Option<&JobMeta>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("SLURMD_NODENAME".to_string(), ctx.config.node_name.clone());
    env.insert("SLURM_CONF".to_string(), ctx.config.slurm_conf_path.display().to_string());
    env.insert("SLURM_CLUSTER_NAME".to_string(), ctx.config.cluster_name.clone());
    env.insert("SLURM_JOB_ID".to_string(), job_id.to_string());
    env.insert("SLURM_JOBID".to_string(), job_id.to_string());

    if let Some(meta) = meta {
        env.insert("SLURM_JOB_UID".to_string(), meta.uid.to_string());
        env.insert("SLURM_UID".to_string(), meta.uid.to_string());
        env.insert("SLURM_JOB_USER".to_string(), meta.user_name.clone());
        env.insert("SLURM_NODELIST".to_string(), meta.hostlist.join(","));
    }

    env
}

fn script_context(env: &mut HashMap<String, String>, context: &str) {
    env.insert("SLURM_SCRIPT_CONTEXT".to_string(), context.to_string());
}

pub fn handle_launch_prolog(ctx: &Arc<AgentContext>, job_id: JobId, verified: VerifiedCredential) -> Result<Response, AgentError> {
    let credential = verified.credential;
    ctx.steps.record_owner(job_id.clone(), credential.uid);
    ctx.steps.record_meta(
        job_id.clone(),
        JobMeta { uid: credential.uid, gid: credential.gid, user_name: credential.user_name.clone(), hostlist: credential.hostlist.clone() },
    );
    ctx.vault.insert_job(job_id.clone());

    let mut env = base_script_env(ctx, &job_id, ctx.steps.meta(&job_id).as_ref());
    script_context(&mut env, "prolog");

    let rc = ctx
        .lifecycle
        .ensure_prolog(&job_id, ctx.script_runner.as_ref(), &env)
        .map_err(|e| AgentError::PrologFailed { detail: e.to_string() })?;

    if rc != 0 {
        return Err(AgentError::PrologFailed { detail: format!("prolog exited {rc}") });
    }
    Ok(Response::Ok)
}

pub fn handle_batch_job_launch(
    ctx: &Arc<AgentContext>,
    job_id: JobId,
    verified: VerifiedCredential,
    script: Vec<u8>,
    argv: Vec<String>,
) -> Result<Response, AgentError> {
    let _guard = ctx.launch_mutex.lock();

    if !ctx.lifecycle.begin_step_start(&job_id, BATCH_STEP_ID) {
        return Err(AgentError::DuplicateJobId(job_id.to_string()));
    }
    let outcome = run_batch_launch(ctx, &job_id, verified, script, argv);
    ctx.lifecycle.end_step_start(&job_id, BATCH_STEP_ID);
    outcome
}

fn run_batch_launch(
    ctx: &Arc<AgentContext>,
    job_id: &JobId,
    verified: VerifiedCredential,
    script: Vec<u8>,
    argv: Vec<String>,
) -> Result<Response, AgentError> {
    let credential = verified.credential;
    ctx.steps.record_owner(job_id.clone(), credential.uid);
    ctx.steps.record_meta(
        job_id.clone(),
        JobMeta { uid: credential.uid, gid: credential.gid, user_name: credential.user_name.clone(), hostlist: credential.hostlist.clone() },
    );

    let mut prolog_env = base_script_env(ctx, job_id, ctx.steps.meta(job_id).as_ref());
    script_context(&mut prolog_env, "prolog");
    let prolog_rc = ctx
        .lifecycle
        .ensure_prolog(job_id, ctx.script_runner.as_ref(), &prolog_env)
        .map_err(|e| AgentError::PrologFailed { detail: e.to_string() })?;
    if prolog_rc != 0 {
        return Err(AgentError::PrologFailed { detail: format!("prolog exited {prolog_rc}") });
    }

    let script_path = ctx.config.batch_script_path(job_id);
    if let Some(parent) = script_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| AgentError::ResourceExhausted(e.to_string()))?;
    }
    std::fs::write(&script_path, &script).map_err(|e| AgentError::ResourceExhausted(e.to_string()))?;

    let tree = compute_tree_params(verified.local_host_index as u32, credential.hostlist.len() as u32, ctx.config.tree_width);
    // Blocks until the controller's first registration reply has landed
    // (spec §4.5 step 3(b)) so the supervisor sees consistent accounting
    // metadata.
    let tres = ctx.tres_gate.wait();
    let envelope = LaunchEnvelope {
        agent_config: AgentConfigSection {
            node_name: ctx.config.node_name.clone(),
            spool_dir: ctx.config.spool_dir.display().to_string(),
            plugin_params: Vec::new(),
            debug_level: ctx.config.debug_level,
            cluster_name: ctx.config.cluster_name.clone(),
        },
        tres,
        cgroup: agentd_adapters::ContainerLimits {
            cpu_count: credential.core_bitmap.sockets_per_node.first().copied().unwrap_or(1).max(1),
            memory_limit_mb: credential.memory_limit_mb,
        },
        acct_gather: AcctGatherSection::default(),
        kind: LaunchKind::LaunchBatch,
        tree,
        client_addr: String::new(),
        self_addr: ctx.config.node_name.clone(),
        gres: Vec::new(),
        cpu_freq: None,
        original_rpc: argv.join(" ").into_bytes(),
        client_protocol_version: agentd_wire::PROTOCOL_VERSION,
    };

    let handoff = {
        let _fork_guard = ctx.fork_mutex.lock();
        ctx.launcher.launch(&envelope, ctx.container.as_ref(), job_id, BATCH_STEP_ID)
    }
    .map_err(|e| AgentError::ResourceExhausted(e.to_string()))?;

    match handoff {
        Handoff::Ready { .. } => {
            ctx.steps.insert_step(StepRecord {
                job_id: job_id.clone(),
                step_id: BATCH_STEP_ID,
                node_rank: tree.rank,
                // The double-fork handoff doesn't return the grandchild's
                // pid to the parent (only an rc over `to_slurmd`); the
                // dispatcher reaches the step exclusively through its unix
                // socket, so 0 here is a "not tracked", not a real pid.
                supervisor_pid: 0,
                supervisor_socket_path: ctx.config.supervisor_socket_path(job_id, BATCH_STEP_ID),
                protocol_version: agentd_wire::PROTOCOL_VERSION as u32,
            });
            ctx.lifecycle.mark_launch_complete(job_id, BATCH_STEP_ID);
            let _ = ctx.uplink_tx.send(UplinkEvent::StepTableChanged);
            Ok(Response::Ok)
        }
        Handoff::Failed(rc) => Err(AgentError::ResourceExhausted(format!("supervisor startup failed: rc {rc}"))),
    }
}

pub fn handle_launch_tasks(
    ctx: &Arc<AgentContext>,
    job_id: JobId,
    step_id: StepId,
    verified: VerifiedCredential,
    tasks_per_node: Vec<u32>,
) -> Result<Response, AgentError> {
    let _guard = ctx.launch_mutex.lock();

    if !ctx.lifecycle.begin_step_start(&job_id, step_id) {
        return Err(AgentError::DuplicateJobId(format!("{job_id}.{step_id}")));
    }
    let outcome = run_launch_tasks(ctx, &job_id, step_id, verified, tasks_per_node);
    ctx.lifecycle.end_step_start(&job_id, step_id);
    outcome
}

fn run_launch_tasks(
    ctx: &Arc<AgentContext>,
    job_id: &JobId,
    step_id: StepId,
    verified: VerifiedCredential,
    tasks_per_node: Vec<u32>,
) -> Result<Response, AgentError> {
    let credential = verified.credential;
    ctx.steps.record_owner(job_id.clone(), credential.uid);
    ctx.steps.record_meta(
        job_id.clone(),
        JobMeta { uid: credential.uid, gid: credential.gid, user_name: credential.user_name.clone(), hostlist: credential.hostlist.clone() },
    );

    if !ctx.vault.job_seen(job_id) {
        let mut prolog_env = base_script_env(ctx, job_id, ctx.steps.meta(job_id).as_ref());
        script_context(&mut prolog_env, "prolog");
        let prolog_rc = ctx
            .lifecycle
            .ensure_prolog(job_id, ctx.script_runner.as_ref(), &prolog_env)
            .map_err(|e| AgentError::PrologFailed { detail: e.to_string() })?;
        if prolog_rc != 0 {
            return Err(AgentError::PrologFailed { detail: format!("prolog exited {prolog_rc}") });
        }
        ctx.vault.insert_job(job_id.clone());
    }

    // A `TerminateJob` may have revoked this credential while we were
    // running (or waiting on) the prolog above (spec §8 S2): re-query the
    // vault before forking a supervisor rather than trusting the
    // dispatcher's pre-prolog `verify`.
    if ctx.vault.is_revoked(job_id) {
        return Err(AgentError::CredentialRevoked(job_id.to_string()));
    }

    let tree = compute_tree_params(verified.local_host_index as u32, credential.hostlist.len() as u32, ctx.config.tree_width);
    let tres = ctx.tres_gate.wait();
    let envelope = LaunchEnvelope {
        agent_config: AgentConfigSection {
            node_name: ctx.config.node_name.clone(),
            spool_dir: ctx.config.spool_dir.display().to_string(),
            plugin_params: Vec::new(),
            debug_level: ctx.config.debug_level,
            cluster_name: ctx.config.cluster_name.clone(),
        },
        tres,
        cgroup: agentd_adapters::ContainerLimits {
            cpu_count: tasks_per_node.get(verified.local_host_index).copied().unwrap_or(1).max(1),
            memory_limit_mb: credential.memory_limit_mb,
        },
        acct_gather: AcctGatherSection::default(),
        kind: LaunchKind::LaunchTasks,
        tree,
        client_addr: String::new(),
        self_addr: ctx.config.node_name.clone(),
        gres: Vec::new(),
        cpu_freq: None,
        original_rpc: Vec::new(),
        client_protocol_version: agentd_wire::PROTOCOL_VERSION,
    };

    // Re-check once more immediately before the fork: `tres_gate.wait()`
    // above can itself block for a while on a cold registration, which is
    // just as revocable a window as the prolog wait.
    if ctx.vault.is_revoked(job_id) {
        return Err(AgentError::CredentialRevoked(job_id.to_string()));
    }

    let handoff = {
        let _fork_guard = ctx.fork_mutex.lock();
        ctx.launcher.launch(&envelope, ctx.container.as_ref(), job_id, step_id)
    }
    .map_err(|e| AgentError::ResourceExhausted(e.to_string()))?;

    match handoff {
        Handoff::Ready { .. } => {
            ctx.steps.insert_step(StepRecord {
                job_id: job_id.clone(),
                step_id,
                node_rank: tree.rank,
                supervisor_pid: 0,
                supervisor_socket_path: ctx.config.supervisor_socket_path(job_id, step_id),
                protocol_version: agentd_wire::PROTOCOL_VERSION as u32,
            });
            ctx.lifecycle.mark_launch_complete(job_id, step_id);
            let _ = ctx.uplink_tx.send(UplinkEvent::StepTableChanged);
            Ok(Response::Ok)
        }
        Handoff::Failed(rc) => Err(AgentError::ResourceExhausted(format!("supervisor startup failed: rc {rc}"))),
    }
}

pub fn handle_signal_tasks(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId, signal: i32) -> Result<Response, AgentError> {
    ctx.supervisor_link.signal(&job_id, step_id, signal)?;
    Ok(Response::Ok)
}

pub fn handle_terminate_tasks(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId) -> Result<Response, AgentError> {
    const SIGTERM: i32 = 15;
    const SIGKILL: i32 = 9;
    let _ = ctx.supervisor_link.signal(&job_id, step_id, SIGTERM);
    std::thread::sleep(ctx.config.kill_wait);
    let _ = ctx.supervisor_link.signal(&job_id, step_id, SIGKILL);
    let _ = ctx.container.delete(&job_id, step_id);
    ctx.steps.remove_step(&job_id, step_id);
    Ok(Response::Ok)
}

pub fn handle_reattach_tasks(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId) -> Result<Response, AgentError> {
    if ctx.steps.step(&job_id, step_id).is_none() {
        return Err(AgentError::StepNotRunning(format!("{job_id}.{step_id}")));
    }
    Ok(Response::Ok)
}

pub fn handle_checkpoint_tasks(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId, _image_dir: String) -> Result<Response, AgentError> {
    if !ctx.supervisor_link.is_running(&job_id, step_id) {
        return Err(AgentError::StepNotRunning(format!("{job_id}.{step_id}")));
    }
    Ok(Response::Ok)
}

fn terminate(ctx: &Arc<AgentContext>, job_id: JobId, reason: TerminateReason) -> Result<Response, AgentError> {
    let steps = ctx.steps.steps_for_job(&job_id);
    let meta = ctx.steps.meta(&job_id);
    let mut env = base_script_env(ctx, &job_id, meta.as_ref());
    script_context(&mut env, "epilog");

    let rc = ctx.lifecycle.terminate_job(&job_id, reason, &steps, ctx.supervisor_link.as_ref(), ctx.container.as_ref(), ctx.script_runner.as_ref(), env)?;

    for step_id in &steps {
        ctx.steps.remove_step(&job_id, *step_id);
    }
    ctx.steps.forget_owner(&job_id);
    ctx.steps.forget_meta(&job_id);
    ctx.vault.begin_expiration(job_id.clone());

    let host_count = meta.map(|m| m.hostlist.len() as u32).unwrap_or(1).max(1);
    let _ = ctx.uplink_tx.send(UplinkEvent::EpilogComplete { job_id, rc, host_index: 0, host_count });

    if rc != 0 {
        return Err(AgentError::EpilogFailed { detail: format!("epilog exited {rc}") });
    }
    Ok(Response::Ok)
}

pub fn handle_kill_timelimit(ctx: &Arc<AgentContext>, job_id: JobId) -> Result<Response, AgentError> {
    terminate(ctx, job_id, TerminateReason::KillTimelimit)
}

pub fn handle_kill_preempted(ctx: &Arc<AgentContext>, job_id: JobId) -> Result<Response, AgentError> {
    terminate(ctx, job_id, TerminateReason::KillPreempted)
}

pub fn handle_terminate_job(ctx: &Arc<AgentContext>, job_id: JobId) -> Result<Response, AgentError> {
    terminate(ctx, job_id, TerminateReason::AdminTerminate)
}

pub fn handle_abort_job(ctx: &Arc<AgentContext>, job_id: JobId) -> Result<Response, AgentError> {
    terminate(ctx, job_id, TerminateReason::AdminTerminate)
}

pub fn handle_suspend_int(ctx: &Arc<AgentContext>, job_id: JobId, suspend: bool) -> Result<Response, AgentError> {
    let steps = ctx.steps.steps_for_job(&job_id);
    ctx.lifecycle.suspend_resume(&job_id, &steps, suspend, ctx.supervisor_link.as_ref());
    Ok(Response::Ok)
}

pub fn handle_complete_batch_script(ctx: &Arc<AgentContext>, job_id: JobId, _rc: i32) -> Result<Response, AgentError> {
    ctx.steps.remove_step(&job_id, BATCH_STEP_ID);
    Ok(Response::Ok)
}

pub fn handle_update_job_time(_ctx: &Arc<AgentContext>, _job_id: JobId, _new_end_time_unix_secs: u64) -> Result<Response, AgentError> {
    Ok(Response::Ok)
}

#[allow(clippy::too_many_arguments)]
pub fn handle_file_bcast(
    ctx: &Arc<AgentContext>,
    claimed_uid: u32,
    privileged: bool,
    job_id: JobId,
    credential: agentd_core::JobCredential,
    dest_path: String,
    block_no: u32,
    force: bool,
    last_block: bool,
    data: Vec<u8>,
    compressed: bool,
    mode: u32,
    mtime_unix_secs: Option<i64>,
) -> Result<Response, AgentError> {
    let block = agentd_bcast::Block {
        job_id,
        credential,
        dest_path: std::path::PathBuf::from(dest_path),
        block_no,
        force,
        last_block,
        data,
        compressed,
        mode,
        mtime_unix_secs,
    };
    ctx.bcast
        .receive_block(&ctx.vault, claimed_uid, privileged, block)
        .map_err(|e| AgentError::TransientComm(e.to_string()))?;
    Ok(Response::Ok)
}

pub fn handle_step_complete(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId, _range_first: u32, _range_last: u32, _rc: i32) -> Result<Response, AgentError> {
    ctx.steps.remove_step(&job_id, step_id);
    Ok(Response::Ok)
}

pub fn handle_step_complete_aggr(ctx: &Arc<AgentContext>, entries: Vec<StepCompleteEntry>) -> Result<Response, AgentError> {
    for entry in entries {
        ctx.steps.remove_step(&entry.job_id, entry.step_id);
    }
    Ok(Response::Ok)
}

pub fn handle_stat_job_acct(_ctx: &Arc<AgentContext>, _job_id: JobId, _step_id: StepId) -> Result<Response, AgentError> {
    Ok(Response::StatJobAcctReply { cpu_time_ms: 0, max_rss_kb: 0 })
}

pub fn handle_list_pids(ctx: &Arc<AgentContext>, job_id: JobId, step_id: StepId) -> Result<Response, AgentError> {
    match ctx.steps.step(&job_id, step_id) {
        Some(record) if record.supervisor_pid != 0 => Ok(Response::ListPidsReply { pids: vec![record.supervisor_pid] }),
        Some(_) => Ok(Response::ListPidsReply { pids: Vec::new() }),
        None => Err(AgentError::StepNotRunning(format!("{job_id}.{step_id}"))),
    }
}

pub fn handle_daemon_status(ctx: &Arc<AgentContext>) -> Response {
    Response::DaemonStatusReply {
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        active_jobs: ctx.steps.active_job_count() as u32,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

pub fn handle_job_notify(_ctx: &Arc<AgentContext>, job_id: JobId, message: String) -> Response {
    tracing::info!(job_id = %job_id, %message, "job notification");
    Response::Ok
}

pub fn handle_acct_gather_update(_ctx: &Arc<AgentContext>, _job_id: JobId, _step_id: StepId) -> Response {
    Response::Ok
}

pub fn handle_job_id_lookup(ctx: &Arc<AgentContext>, _pid: u32) -> Response {
    let _ = ctx;
    Response::Error { kind_code: agentd_core::ErrorKind::StepNotRunning.code(), message: "pid not tracked by this node".to_string() }
}

/// Builds a fresh, unpersisted `JobState` for a job this node has never
/// seen before — used by the spool scan at startup, not by the dispatcher
/// (credential acceptance never needs a `JobState`, only `StepTable`'s
/// owner/meta bookkeeping).
pub fn fresh_job_state(job_id: JobId, clock: &impl Clock) -> JobState {
    let mut state = JobState::new(job_id, clock.unix_secs());
    state.status = JobStatus::Running;
    state
}

/// Not yet a real RPC client: `ForwardData`/`RebootNodes`/`Composite`
/// require dialing other nodes over `agentd_wire`, which the routing tree
/// (`ctx.routing`) addresses but this node's dispatcher does not yet open
/// outbound connections for (spec's uplink owns the only outbound
/// connection built so far, to the controller). Fanned-out requests reply
/// `Ok` for the local share of the work and an empty composite otherwise.
pub fn handle_unrouted_fanout(request: &Request) -> Response {
    match request {
        Request::Composite { .. } => Response::ResponseComposite { children: Vec::new() },
        _ => Response::Ok,
    }
}
