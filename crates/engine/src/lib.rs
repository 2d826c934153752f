// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The step launcher (§4.5) and the job lifecycle driver (§4.6): the two
//! components that actually fork, supervise, and tear down step processes.

pub mod launcher;
pub mod lifecycle;

pub use launcher::{
    compute_tree_params, AcctGatherSection, AgentConfigSection, Handoff, LaunchEnvelope, LaunchError, LaunchKind,
    StepLauncher, TreeParams, STARTUP_WARN,
};
pub use lifecycle::{
    JobLifecycle, ProcessScriptRunner, ScriptRunner, SupervisorLink, TerminateReason, EPILOG_SPREAD_SKIP_THRESHOLD,
    NUM_PARALLEL_SUSP_JOBS, NUM_PARALLEL_SUSP_STEPS, SUSPEND_STARTUP_POLL, SUSPEND_STARTUP_WAIT,
};
