// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The error taxonomy every RPC reply is serialized against (spec §7).
//!
//! Every handler in `agentd`/`agentd-engine`/`agentd-bcast` returns a
//! `Result<_, AgentError>`; the dispatcher's reply path (`agentd::listener`)
//! is the only place that turns a variant into the numeric code the wire
//! protocol carries, mirroring the teacher's practice of a single crate-local
//! error enum converted at the RPC boundary (`ExecuteError`, `LifecycleError`).

use thiserror::Error;

/// One of the eight error kinds named in spec §7. Every `AgentError`
/// belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthError,
    TransientCommError,
    StepNotRunning,
    PrologFailed,
    EpilogFailed,
    CredentialRevoked,
    DuplicateJobId,
    ResourceExhausted,
    FatalConfigError,
}

impl ErrorKind {
    /// Numeric code carried on the wire; clients switch on this, never on
    /// the message text (spec §7: "message text is advisory only").
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::AuthError => 1,
            ErrorKind::TransientCommError => 2,
            ErrorKind::StepNotRunning => 3,
            ErrorKind::PrologFailed => 4,
            ErrorKind::EpilogFailed => 5,
            ErrorKind::CredentialRevoked => 6,
            ErrorKind::DuplicateJobId => 7,
            ErrorKind::ResourceExhausted => 8,
            ErrorKind::FatalConfigError => 9,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("uid {uid} is not authorized for this request")]
    UserIdMissing { uid: u32 },

    #[error("transient communication error: {0}")]
    TransientComm(String),

    #[error("step {0} is not running")]
    StepNotRunning(String),

    #[error("prolog failed: {detail}")]
    PrologFailed { detail: String },

    #[error("epilog failed: {detail}")]
    EpilogFailed { detail: String },

    #[error("credential for job {0} has been revoked")]
    CredentialRevoked(String),

    #[error("job {0} is already running on this node")]
    DuplicateJobId(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("fatal configuration error: {0}")]
    FatalConfig(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Auth(_) | AgentError::UserIdMissing { .. } => ErrorKind::AuthError,
            AgentError::TransientComm(_) => ErrorKind::TransientCommError,
            AgentError::StepNotRunning(_) => ErrorKind::StepNotRunning,
            AgentError::PrologFailed { .. } => ErrorKind::PrologFailed,
            AgentError::EpilogFailed { .. } => ErrorKind::EpilogFailed,
            AgentError::CredentialRevoked(_) => ErrorKind::CredentialRevoked,
            AgentError::DuplicateJobId(_) => ErrorKind::DuplicateJobId,
            AgentError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            AgentError::FatalConfig(_) => ErrorKind::FatalConfigError,
        }
    }

    /// Whether this error is fatal to the whole agent process (spec §7:
    /// "handlers catch everything except FatalConfigError").
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::FatalConfig(_))
    }
}
