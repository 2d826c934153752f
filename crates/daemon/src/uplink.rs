// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The controller uplink (spec §4.9): the only outbound connection this
//! agent opens. Registers the node at startup and whenever the step table
//! changes shape, reports epilog completions (spread out with
//! `JobLifecycle::epilog_complete_delay` so a wide job's nodes don't all
//! answer in the same instant), and pings the controller on a fixed
//! interval so a silently-wedged uplink gets noticed from this side too.
//!
//! Mirrors the teacher's `crons` module: one background thread, one
//! `crossbeam_channel::select!` over a ticker and an event queue, no async
//! runtime underneath it (spec §5's fork-safety discipline already ruled
//! that out for the rest of the daemon).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use agentd_core::{AgentError, NodeId};
use agentd_wire::{decode, encode, read_envelope, write_envelope, AuthHeader, EnvelopeFlags, Request, Response, RunningStep};

use crate::context::{AgentContext, UplinkEvent};

/// How often the uplink pings the controller absent any other traffic
/// (spec §4.9: "a periodic ping/health-check loop").
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Dial/round-trip timeout for every controller call — a wedged controller
/// must not wedge this node's uplink thread forever.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-host spacing used by the epilog-complete clock-spread (spec §4.6),
/// mirrors slurmd's `EpilogMsgTime` default.
const EPILOG_MSG_TIME: Duration = Duration::from_micros(2000);

/// Runs the uplink loop until `ctx` is asked to shut down. Intended to run
/// on its own thread, spawned once by `main`.
pub fn run(ctx: Arc<AgentContext>) {
    if let Err(e) = register(&ctx) {
        tracing::warn!(error = %e, "initial controller registration failed, will retry on next tick");
    }

    let rx = ctx.take_uplink_rx();
    let ticker = crossbeam_channel::tick(PING_INTERVAL);

    while !ctx.is_shutting_down() {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                if let Err(e) = ping(&ctx) {
                    tracing::warn!(error = %e, "controller ping failed");
                }
            }
            recv(rx) -> event => match event {
                Ok(UplinkEvent::StepTableChanged) => {
                    if let Err(e) = register(&ctx) {
                        tracing::warn!(error = %e, "re-registration after step table change failed");
                    }
                }
                Ok(UplinkEvent::EpilogComplete { job_id, rc, host_index, host_count }) => {
                    let total_expected = EPILOG_MSG_TIME * host_count;
                    let delay = ctx.lifecycle.epilog_complete_delay(host_index, host_count, EPILOG_MSG_TIME, total_expected);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    if let Err(e) = call(&ctx, Request::EpilogComplete { job_id: job_id.clone(), rc }) {
                        tracing::warn!(job_id = %job_id, error = %e, "epilog-complete report failed");
                    }
                }
                Err(_) => break,
            },
        }
    }
}

/// Sends `RegisterNode` with every step the spool scan or a subsequent
/// launch has recorded, and feeds the reply's TRES list to `ctx.tres_gate`
/// so any launch blocked in `TresGate::wait` unblocks (spec §4.5 step
/// 3(b), spec §5's ordering guarantee).
fn register(ctx: &Arc<AgentContext>) -> Result<(), AgentError> {
    let running_steps = ctx.steps.all_steps().into_iter().map(|(job_id, step_id)| RunningStep { job_id, step_id }).collect();

    let request = Request::RegisterNode {
        node: NodeId::from(ctx.config.node_name.as_str()),
        running_steps,
        uptime_secs: ctx.started_at.elapsed().as_secs(),
    };

    match call(ctx, request)? {
        Response::NodeRegistrationStatus { status_json, .. } => {
            ctx.tres_gate.set(parse_tres(&status_json));
            Ok(())
        }
        // A controller speaking strictly-by-the-book might just say `Ok`;
        // treat that as "no TRES assignment" rather than blocking forever.
        _ => {
            ctx.tres_gate.set(Vec::new());
            Ok(())
        }
    }
}

/// Best-effort health probe: also drives the same housekeeping the
/// dispatcher's inbound `HealthCheck` arm runs, so an idle node that never
/// receives one still reaps expired credentials and stalled bcast state.
fn ping(ctx: &Arc<AgentContext>) -> Result<(), AgentError> {
    ctx.vault.purge_expired();
    ctx.bcast.gc_stalled();
    call(ctx, Request::Ping).map(|_| ())
}

/// The controller's `status_json` is a small JSON object carrying whatever
/// the controller wants to hand back at registration time; the only field
/// this node reads today is `tres`, a node-local TRES assignment list
/// (spec is silent on the object's exact shape, so absence or a decode
/// failure just means "no TRES assignment" rather than a hard error).
fn parse_tres(status_json: &str) -> Vec<String> {
    #[derive(serde::Deserialize)]
    struct StatusPayload {
        #[serde(default)]
        tres: Vec<String>,
    }
    serde_json::from_str::<StatusPayload>(status_json).map(|p| p.tres).unwrap_or_default()
}

fn call(ctx: &Arc<AgentContext>, request: Request) -> Result<Response, AgentError> {
    let mut stream = TcpStream::connect(&ctx.config.controller_addr).map_err(|e| AgentError::TransientComm(e.to_string()))?;
    stream.set_read_timeout(Some(CALL_TIMEOUT)).ok();
    stream.set_write_timeout(Some(CALL_TIMEOUT)).ok();

    send_request(&mut stream, &request)?;
    recv_response(&mut stream)
}

fn send_request(stream: &mut impl Write, request: &Request) -> Result<(), AgentError> {
    let payload = encode(request).map_err(|e| AgentError::TransientComm(e.to_string()))?;
    let auth = AuthHeader { uid: nix::unistd::getuid().as_raw(), gid: nix::unistd::getgid().as_raw(), hmac: [0u8; 32] };
    write_envelope(stream, agentd_wire::PROTOCOL_VERSION, request.msg_type(), EnvelopeFlags::empty(), &auth, &payload)
        .map_err(|e| AgentError::TransientComm(e.to_string()))
}

fn recv_response(stream: &mut impl Read) -> Result<Response, AgentError> {
    let envelope = read_envelope(stream).map_err(|e| AgentError::TransientComm(e.to_string()))?;
    decode(&envelope.payload).map_err(|e| AgentError::TransientComm(e.to_string()))
}
