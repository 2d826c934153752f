// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The RPC dispatcher (spec §4.4): one accept thread over the node's unix
//! socket, handing each connection to a bounded worker pool, each worker
//! reading exactly one request, dispatching it, and writing exactly one
//! reply before closing (spec §7: "no RPC completes silently; no RPC
//! produces two replies").
//!
//! Structurally this is the teacher's `listener::Listener::run_unix_only`
//! accept-loop / `handle_connection` / `handle_request` split, translated
//! from `tokio::spawn` onto a bounded `std::thread` pool: the step
//! launcher and the broadcast receiver's privilege-drop opener both call
//! real `fork()`, which is undefined behavior in a multi-threaded async
//! runtime unless every other thread is quiesced first. A thread-per-
//! connection (bounded) design sidesteps that entirely (spec §5).

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread::JoinHandle;

use agentd_core::AgentError;
use agentd_wire::{decode, encode, read_envelope, write_envelope, AuthHeader, EnvelopeFlags, Request, Response};

use crate::context::AgentContext;
use crate::handlers;

/// Runs the dispatcher's accept loop and worker pool until the listener is
/// closed or the context is asked to shut down. Blocks the calling thread;
/// `main` runs this on a dedicated thread alongside the controller uplink.
pub fn serve(ctx: Arc<AgentContext>, listener: UnixListener) -> std::io::Result<()> {
    let (tx, rx) = crossbeam_channel::bounded::<UnixStream>(ctx.config.max_threads);

    let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(ctx.config.max_threads);
    for _ in 0..ctx.config.max_threads {
        let rx = rx.clone();
        let ctx = ctx.clone();
        workers.push(std::thread::spawn(move || {
            while let Ok(stream) = rx.recv() {
                handle_connection(&ctx, stream);
            }
        }));
    }

    listener.set_nonblocking(false)?;
    for incoming in listener.incoming() {
        if ctx.is_shutting_down() {
            break;
        }
        match incoming {
            Ok(stream) => {
                if tx.send(stream).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }

    drop(tx);
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

fn handle_connection(ctx: &Arc<AgentContext>, mut stream: UnixStream) {
    let envelope = match read_envelope(&mut stream) {
        Ok(envelope) => envelope,
        Err(agentd_wire::WireError::ConnectionClosed) => return,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request envelope");
            return;
        }
    };

    let request: Request = match decode(&envelope.payload) {
        Ok(request) => request,
        Err(e) => {
            reply_error(&mut stream, envelope.protocol_version, envelope.msg_type, &AgentError::Auth(format!("malformed request: {e}")));
            return;
        }
    };

    let claimed_uid = envelope.auth.uid;
    let response = match authorize(ctx, &request, claimed_uid) {
        Ok(()) => dispatch(ctx, &request, claimed_uid),
        Err(e) => Err(e),
    };

    // Echo the request's own msg_type back on the reply envelope — there is
    // no single "generic reply" msg_type, and the client already knows
    // which request it sent, so the pairing is enough to correlate.
    match response {
        Ok(response) => reply_ok(&mut stream, envelope.protocol_version, envelope.msg_type, &response),
        Err(e) => reply_error(&mut stream, envelope.protocol_version, envelope.msg_type, &e),
    }
}

/// The requests every uid may make without being the job owner or the
/// controller — liveness/health probes and read-only lookups the spec
/// never gates on the authorization rule.
fn is_open_to_any_uid(request: &Request) -> bool {
    matches!(
        request,
        Request::Ping | Request::HealthCheck | Request::JobIdLookup { .. } | Request::ForwardData { .. } | Request::NetworkCallerId { .. } | Request::Composite { .. }
    )
}

/// Requests only the controller (or root) may issue — the ones that either
/// establish a job's credential in the first place (so there is no owning
/// uid to check yet) or affect the whole node rather than one job (spec
/// §4.4's authorization rule: "uid == 0 or the configured controller uid").
fn is_privileged_only(request: &Request) -> bool {
    matches!(
        request,
        Request::LaunchProlog { .. }
            | Request::BatchJobLaunch { .. }
            | Request::LaunchTasks { .. }
            | Request::KillTimelimit { .. }
            | Request::KillPreempted { .. }
            | Request::Shutdown
            | Request::Reconfigure
            | Request::RebootNodes { .. }
            | Request::UpdateJobTime { .. }
            | Request::AcctGatherEnergy
            | Request::DaemonStatus
    )
}

fn job_id_of(request: &Request) -> Option<&agentd_core::JobId> {
    match request {
        Request::SignalTasks { job_id, .. }
        | Request::CheckpointTasks { job_id, .. }
        | Request::TerminateTasks { job_id, .. }
        | Request::ReattachTasks { job_id, .. }
        | Request::SuspendInt { job_id, .. }
        | Request::AbortJob { job_id }
        | Request::TerminateJob { job_id }
        | Request::CompleteBatchScript { job_id, .. }
        | Request::AcctGatherUpdate { job_id, .. }
        | Request::FileBcast { job_id, .. }
        | Request::StepComplete { job_id, .. }
        | Request::StatJobAcct { job_id, .. }
        | Request::ListPids { job_id, .. }
        | Request::JobNotify { job_id, .. } => Some(job_id),
        _ => None,
    }
}

fn authorize(ctx: &Arc<AgentContext>, request: &Request, claimed_uid: u32) -> Result<(), AgentError> {
    if is_open_to_any_uid(request) {
        return Ok(());
    }
    if is_privileged_only(request) {
        return if ctx.is_privileged(claimed_uid) { Ok(()) } else { Err(AgentError::UserIdMissing { uid: claimed_uid }) };
    }
    if let Some(job_id) = job_id_of(request) {
        return if ctx.authorize(job_id, claimed_uid)? { Ok(()) } else { Err(AgentError::UserIdMissing { uid: claimed_uid }) };
    }
    // StepCompleteAggr and anything else without a single job_id: only the
    // controller aggregates on a node's behalf.
    if ctx.is_privileged(claimed_uid) { Ok(()) } else { Err(AgentError::UserIdMissing { uid: claimed_uid }) }
}

fn dispatch(ctx: &Arc<AgentContext>, request: &Request, claimed_uid: u32) -> Result<Response, AgentError> {
    let privileged = ctx.is_privileged(claimed_uid);

    match request.clone() {
        Request::Ping => Ok(Response::Pong),
        Request::HealthCheck => {
            ctx.vault.purge_expired();
            ctx.bcast.gc_stalled();
            Ok(Response::Ok)
        }
        Request::DaemonStatus => Ok(handlers::handle_daemon_status(ctx)),
        Request::Shutdown => {
            ctx.request_shutdown();
            Ok(Response::Ok)
        }
        Request::Reconfigure => {
            tracing::info!("reconfigure requested");
            Ok(Response::Ok)
        }
        Request::RebootNodes { .. } => Ok(handlers::handle_unrouted_fanout(request)),
        Request::ForwardData { .. } => Ok(handlers::handle_unrouted_fanout(request)),
        Request::Composite { .. } => Ok(handlers::handle_unrouted_fanout(request)),
        Request::NetworkCallerId { .. } => Ok(Response::Ok),
        Request::AcctGatherEnergy => Ok(Response::Ok),

        Request::LaunchProlog { job_id, credential } => {
            let verified = ctx.vault.verify(&credential, claimed_uid, privileged)?;
            handlers::handle_launch_prolog(ctx, job_id, verified)
        }
        Request::BatchJobLaunch { job_id, credential, script, argv } => {
            let verified = ctx.vault.verify(&credential, claimed_uid, privileged)?;
            handlers::handle_batch_job_launch(ctx, job_id, verified, script, argv)
        }
        Request::LaunchTasks { job_id, step_id, credential, tasks_per_node } => {
            let verified = ctx.vault.verify(&credential, claimed_uid, privileged)?;
            handlers::handle_launch_tasks(ctx, job_id, step_id, verified, tasks_per_node)
        }
        Request::SignalTasks { job_id, step_id, signal } => handlers::handle_signal_tasks(ctx, job_id, step_id, signal),
        Request::CheckpointTasks { job_id, step_id, image_dir } => handlers::handle_checkpoint_tasks(ctx, job_id, step_id, image_dir),
        Request::TerminateTasks { job_id, step_id } => handlers::handle_terminate_tasks(ctx, job_id, step_id),
        Request::KillTimelimit { job_id } => handlers::handle_kill_timelimit(ctx, job_id),
        Request::KillPreempted { job_id } => handlers::handle_kill_preempted(ctx, job_id),
        Request::ReattachTasks { job_id, step_id } => handlers::handle_reattach_tasks(ctx, job_id, step_id),
        Request::SuspendInt { job_id, suspend } => handlers::handle_suspend_int(ctx, job_id, suspend),
        Request::AbortJob { job_id } => handlers::handle_abort_job(ctx, job_id),
        Request::TerminateJob { job_id } => handlers::handle_terminate_job(ctx, job_id),
        Request::CompleteBatchScript { job_id, rc } => handlers::handle_complete_batch_script(ctx, job_id, rc),
        Request::UpdateJobTime { job_id, new_end_time_unix_secs } => handlers::handle_update_job_time(ctx, job_id, new_end_time_unix_secs),
        Request::AcctGatherUpdate { job_id, step_id } => Ok(handlers::handle_acct_gather_update(ctx, job_id, step_id)),
        Request::JobIdLookup { pid } => Ok(handlers::handle_job_id_lookup(ctx, pid)),
        Request::FileBcast { job_id, credential, dest_path, block_no, force, last_block, data, compressed, mode, mtime_unix_secs } => {
            handlers::handle_file_bcast(
                ctx,
                claimed_uid,
                privileged,
                job_id,
                credential,
                dest_path,
                block_no,
                force,
                last_block,
                data,
                compressed,
                mode,
                mtime_unix_secs,
            )
        }
        Request::StepComplete { job_id, step_id, range_first, range_last, rc } => handlers::handle_step_complete(ctx, job_id, step_id, range_first, range_last, rc),
        Request::StepCompleteAggr { entries } => handlers::handle_step_complete_aggr(ctx, entries),
        Request::StatJobAcct { job_id, step_id } => handlers::handle_stat_job_acct(ctx, job_id, step_id),
        Request::ListPids { job_id, step_id } => handlers::handle_list_pids(ctx, job_id, step_id),
        Request::JobNotify { job_id, message } => Ok(handlers::handle_job_notify(ctx, job_id, message)),
        // `RegisterNode`/`EpilogComplete` are node->controller uplink
        // messages (spec §4.9); this node's dispatcher only ever sees one
        // in transit, wrapped inside a `Composite` fan-out from a child
        // it collects for. There is no local work to do beyond the
        // generic composite-relay stub.
        Request::RegisterNode { .. } => Ok(handlers::handle_unrouted_fanout(request)),
        Request::EpilogComplete { .. } => Ok(handlers::handle_unrouted_fanout(request)),
    }
}

fn reply_ok(stream: &mut UnixStream, protocol_version: u16, request_msg_type: u16, response: &Response) {
    let Ok(payload) = encode(response) else {
        tracing::error!("failed to encode response");
        return;
    };
    let auth = AuthHeader { uid: 0, gid: 0, hmac: [0u8; 32] };
    if let Err(e) = write_envelope(stream, protocol_version, request_msg_type, EnvelopeFlags::empty(), &auth, &payload) {
        tracing::warn!(error = %e, "failed to write response envelope");
    }
}

fn reply_error(stream: &mut UnixStream, protocol_version: u16, request_msg_type: u16, err: &AgentError) {
    let response = Response::Error { kind_code: err.kind().code(), message: err.to_string() };
    let Ok(payload) = encode(&response) else {
        return;
    };
    let auth = AuthHeader { uid: 0, gid: 0, hmac: [0u8; 32] };
    let _ = write_envelope(stream, protocol_version, request_msg_type, EnvelopeFlags::empty(), &auth, &payload);
}
