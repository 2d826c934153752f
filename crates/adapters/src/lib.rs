// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trait boundaries for collaborators spec §1 places out of scope
//! (container lifecycle, aggregation topology), each with one reference
//! implementation so the crate compiles and is testable on its own.

pub mod container;
pub mod topology;

pub use container::{CgroupV2Adapter, ContainerAdapter, ContainerError, ContainerLimits};
pub use topology::{RoutingPosition, RoutingTree, StaticRoutingTree};

#[cfg(any(test, feature = "test-support"))]
pub use container::test_support::FakeContainerAdapter;
