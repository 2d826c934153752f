// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential vault (§4.2) and waiter registry (§4.3): the two small
//! mutex/condvar-guarded shared structures hung off the daemon's
//! `AgentContext`.

pub mod persist;
pub mod store;
pub mod waiters;

pub use persist::{atomic_write, read_with_fallback, PersistError};
pub use store::{error_code, Vault, VaultStats, VerifiedCredential, DEFAULT_CRED_LIFETIME_SECS};
pub use waiters::WaiterSet;
