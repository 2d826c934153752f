// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The RPC message catalog (spec §6): every kind of envelope payload the
//! core must be able to decode and dispatch, plus the numeric `msg_type`
//! each one is framed under.

use agentd_core::{JobCredential, JobId, NodeId, StepId};
use serde::{Deserialize, Serialize};

/// Request payloads. One variant per wire message kind named in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Request {
    LaunchProlog { job_id: JobId, credential: JobCredential },
    BatchJobLaunch { job_id: JobId, credential: JobCredential, script: Vec<u8>, argv: Vec<String> },
    LaunchTasks { job_id: JobId, step_id: StepId, credential: JobCredential, tasks_per_node: Vec<u32> },
    SignalTasks { job_id: JobId, step_id: StepId, signal: i32 },
    CheckpointTasks { job_id: JobId, step_id: StepId, image_dir: String },
    TerminateTasks { job_id: JobId, step_id: StepId },
    KillTimelimit { job_id: JobId },
    KillPreempted { job_id: JobId },
    ReattachTasks { job_id: JobId, step_id: StepId },
    SuspendInt { job_id: JobId, suspend: bool },
    AbortJob { job_id: JobId },
    TerminateJob { job_id: JobId },
    CompleteBatchScript { job_id: JobId, rc: i32 },
    UpdateJobTime { job_id: JobId, new_end_time_unix_secs: u64 },
    Shutdown,
    Reconfigure,
    RebootNodes { node_list: Vec<NodeId> },
    Ping,
    HealthCheck,
    AcctGatherUpdate { job_id: JobId, step_id: StepId },
    AcctGatherEnergy,
    JobIdLookup { pid: u32 },
    FileBcast {
        job_id: JobId,
        credential: JobCredential,
        dest_path: String,
        block_no: u32,
        force: bool,
        last_block: bool,
        data: Vec<u8>,
        /// Whether `data` is zstd-compressed (spec §4.8 step 3: "algorithm
        /// identified in the message header").
        compressed: bool,
        /// Destination file mode requested by the sender, applied on the
        /// last block (spec §4.8 step 5).
        mode: u32,
        /// Destination mtime requested by the sender, applied on the last
        /// block (spec §4.8 step 5). `None` leaves the current mtime alone.
        mtime_unix_secs: Option<i64>,
    },
    StepComplete { job_id: JobId, step_id: StepId, range_first: u32, range_last: u32, rc: i32 },
    StepCompleteAggr { entries: Vec<StepCompleteEntry> },
    StatJobAcct { job_id: JobId, step_id: StepId },
    ListPids { job_id: JobId, step_id: StepId },
    DaemonStatus,
    JobNotify { job_id: JobId, message: String },
    ForwardData { node_list: Vec<NodeId>, inner: Vec<u8> },
    NetworkCallerId { job_id: JobId, ip: String, port: u16 },
    Composite { children: Vec<AddressedRequest> },
    /// Sent by a node to the controller on startup and after any step
    /// table change (spec §4.9): "registration reports every (job, step)
    /// pair the spool-directory scan discovered still running".
    RegisterNode { node: NodeId, running_steps: Vec<RunningStep>, uptime_secs: u64 },
    /// Sent by a node to the controller once a job's epilog has finished
    /// (spec §4.9 "epilog-complete RPC").
    EpilogComplete { job_id: JobId, rc: i32 },
}

/// One `(job, step)` pair a node reports as currently running, part of a
/// `RegisterNode` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningStep {
    pub job_id: JobId,
    pub step_id: StepId,
}

/// One aggregated `StepComplete` entry inside a `StepCompleteAggr`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompleteEntry {
    pub job_id: JobId,
    pub step_id: StepId,
    pub range_first: u32,
    pub range_last: u32,
    pub rc: i32,
}

/// A request destined for one node inside a `Composite` fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressedRequest {
    pub node: NodeId,
    pub request: Request,
}

/// Response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Response {
    Ok,
    Error { kind_code: i32, message: String },
    NodeRegistrationStatus { node: NodeId, steps: Vec<StepId>, status_json: String },
    Pong,
    DaemonStatusReply { uptime_secs: u64, active_jobs: u32, version: String },
    ListPidsReply { pids: Vec<u32> },
    StatJobAcctReply { cpu_time_ms: u64, max_rss_kb: u64 },
    ResponseComposite { children: Vec<AddressedResponse> },
}

/// One node's reply inside a `ResponseComposite` aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressedResponse {
    pub node: NodeId,
    pub response: Response,
}

/// Stable numeric `msg_type` for each request/response variant, assigned
/// once and never renumbered (clients pin on these, per spec §6).
pub mod msg_type {
    pub const LAUNCH_PROLOG: u16 = 1001;
    pub const BATCH_JOB_LAUNCH: u16 = 1002;
    pub const LAUNCH_TASKS: u16 = 1003;
    pub const SIGNAL_TASKS: u16 = 1004;
    pub const CHECKPOINT_TASKS: u16 = 1005;
    pub const TERMINATE_TASKS: u16 = 1006;
    pub const KILL_TIMELIMIT: u16 = 1007;
    pub const KILL_PREEMPTED: u16 = 1008;
    pub const REATTACH_TASKS: u16 = 1009;
    pub const SUSPEND_INT: u16 = 1010;
    pub const ABORT_JOB: u16 = 1011;
    pub const TERMINATE_JOB: u16 = 1012;
    pub const COMPLETE_BATCH_SCRIPT: u16 = 1013;
    pub const UPDATE_JOB_TIME: u16 = 1014;
    pub const SHUTDOWN: u16 = 1015;
    pub const RECONFIGURE: u16 = 1016;
    pub const REBOOT_NODES: u16 = 1017;
    pub const PING: u16 = 1018;
    pub const HEALTH_CHECK: u16 = 1019;
    pub const ACCT_GATHER_UPDATE: u16 = 1020;
    pub const ACCT_GATHER_ENERGY: u16 = 1021;
    pub const JOB_ID_LOOKUP: u16 = 1022;
    pub const FILE_BCAST: u16 = 1023;
    pub const STEP_COMPLETE: u16 = 1024;
    pub const STEP_COMPLETE_AGGR: u16 = 1025;
    pub const STAT_JOB_ACCT: u16 = 1026;
    pub const LIST_PIDS: u16 = 1027;
    pub const DAEMON_STATUS: u16 = 1028;
    pub const JOB_NOTIFY: u16 = 1029;
    pub const FORWARD_DATA: u16 = 1030;
    pub const NETWORK_CALLER_ID: u16 = 1031;
    pub const COMPOSITE: u16 = 1032;
    pub const NODE_REGISTRATION_STATUS: u16 = 2001;
    pub const RESPONSE_COMPOSITE: u16 = 2002;
    pub const REGISTER_NODE: u16 = 2003;
    pub const EPILOG_COMPLETE: u16 = 2004;
}

impl Request {
    /// The `msg_type` this variant is framed under.
    pub fn msg_type(&self) -> u16 {
        use msg_type::*;
        match self {
            Request::LaunchProlog { .. } => LAUNCH_PROLOG,
            Request::BatchJobLaunch { .. } => BATCH_JOB_LAUNCH,
            Request::LaunchTasks { .. } => LAUNCH_TASKS,
            Request::SignalTasks { .. } => SIGNAL_TASKS,
            Request::CheckpointTasks { .. } => CHECKPOINT_TASKS,
            Request::TerminateTasks { .. } => TERMINATE_TASKS,
            Request::KillTimelimit { .. } => KILL_TIMELIMIT,
            Request::KillPreempted { .. } => KILL_PREEMPTED,
            Request::ReattachTasks { .. } => REATTACH_TASKS,
            Request::SuspendInt { .. } => SUSPEND_INT,
            Request::AbortJob { .. } => ABORT_JOB,
            Request::TerminateJob { .. } => TERMINATE_JOB,
            Request::CompleteBatchScript { .. } => COMPLETE_BATCH_SCRIPT,
            Request::UpdateJobTime { .. } => UPDATE_JOB_TIME,
            Request::Shutdown => SHUTDOWN,
            Request::Reconfigure => RECONFIGURE,
            Request::RebootNodes { .. } => REBOOT_NODES,
            Request::Ping => PING,
            Request::HealthCheck => HEALTH_CHECK,
            Request::AcctGatherUpdate { .. } => ACCT_GATHER_UPDATE,
            Request::AcctGatherEnergy => ACCT_GATHER_ENERGY,
            Request::JobIdLookup { .. } => JOB_ID_LOOKUP,
            Request::FileBcast { .. } => FILE_BCAST,
            Request::StepComplete { .. } => STEP_COMPLETE,
            Request::StepCompleteAggr { .. } => STEP_COMPLETE_AGGR,
            Request::StatJobAcct { .. } => STAT_JOB_ACCT,
            Request::ListPids { .. } => LIST_PIDS,
            Request::DaemonStatus => DAEMON_STATUS,
            Request::JobNotify { .. } => JOB_NOTIFY,
            Request::ForwardData { .. } => FORWARD_DATA,
            Request::NetworkCallerId { .. } => NETWORK_CALLER_ID,
            Request::Composite { .. } => COMPOSITE,
            Request::RegisterNode { .. } => REGISTER_NODE,
            Request::EpilogComplete { .. } => EPILOG_COMPLETE,
        }
    }

    /// True for requests whose job/step lifetime spans the reverse tree and
    /// so are eligible for `Composite` aggregation on the way down and
    /// `StepCompleteAggr`-style coalescing on the way up (spec §4.9).
    pub fn is_fanned_out(&self) -> bool {
        matches!(self, Request::Composite { .. } | Request::ForwardData { .. } | Request::RebootNodes { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_core::test_support::CredentialBuilder;

    #[test]
    fn every_request_variant_round_trips_through_json() {
        let requests = vec![
            Request::Ping,
            Request::Shutdown,
            Request::LaunchTasks {
                job_id: JobId::from("100"),
                step_id: 0,
                credential: CredentialBuilder::new("100", 0).build(),
                tasks_per_node: vec![2, 2],
            },
            Request::SignalTasks { job_id: JobId::from("100"), step_id: 0, signal: 15 },
        ];

        for request in requests {
            let json = serde_json::to_vec(&request).expect("serialize");
            let back: Request = serde_json::from_slice(&json).expect("deserialize");
            assert_eq!(back.msg_type(), request.msg_type());
        }
    }

    #[test]
    fn composite_and_forward_data_are_fanned_out() {
        assert!(Request::Composite { children: Vec::new() }.is_fanned_out());
        assert!(Request::ForwardData { node_list: Vec::new(), inner: Vec::new() }.is_fanned_out());
        assert!(!Request::Ping.is_fanned_out());
    }
}
