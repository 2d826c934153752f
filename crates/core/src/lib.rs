// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared types for the node agent: identifiers, the node-local data model,
//! the clock abstraction, the error taxonomy, and reverse-tree arithmetic.
//!
//! Every other `agentd-*` crate depends on this one and none of its
//! siblings; it has no I/O of its own.

pub mod clock;
pub mod error;
pub mod ids;
pub mod model;
pub mod reverse_tree;

#[cfg(feature = "test-support")]
pub mod test_support;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{AgentError, ErrorKind};
pub use ids::{JobId, NodeId, StepId, StepKey, BATCH_STEP_ID, EXTERN_STEP_ID};
pub use model::{
    CoreBitmap, JobCredential, JobState, JobStatus, LocalNode, NodeCoreView, RevocationEntry, StepRecord, X11Policy,
};
