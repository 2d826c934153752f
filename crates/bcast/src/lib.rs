// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! File-broadcast receiver (spec §4.8): the node-local half of an
//! `sbcast`-style push, credential-checked and block-ordered against a
//! transfer table protected by a writer-preferring read/write lock.

pub mod receiver;
pub mod rwlock;

pub use receiver::{BcastError, BcastReceiver, Block, DestinationOpener, ForkingOpener, FILE_BCAST_TIMEOUT_SECS};
pub use rwlock::PreemptingRwLock;

#[cfg(any(test, feature = "test-support"))]
pub use receiver::test_support;
