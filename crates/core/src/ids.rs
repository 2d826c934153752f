// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Strongly-typed identifiers threaded through the agent.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::borrow::Borrow;
use std::fmt;

macro_rules! string_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub SmolStr);

        impl $name {
            pub fn new(id: impl Into<SmolStr>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(SmolStr::new(s))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(SmolStr::new(s))
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.0.as_str()
            }
        }
    };
}

string_id!(JobId, "Controller-assigned job identifier.");
string_id!(NodeId, "Opaque node identifier — never parsed as a DNS name (see Open Questions).");

/// Step index within a job. A plain `i64`, not a string newtype: the
/// reverse-tree rank math and the reserved sentinels below need integer
/// arithmetic, and the wire format carries it as a signed int (spec §6).
pub type StepId = i64;

/// Reserved step id for the implicit batch-script step (mirrors Slurm's
/// `SLURM_BATCH_SCRIPT` sentinel).
pub const BATCH_STEP_ID: StepId = -2;
/// Reserved step id meaning "every step of the job" (used by `SignalTasks`).
pub const EXTERN_STEP_ID: StepId = -3;

/// Composite key identifying one step on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub job_id: JobId,
    pub step_id: StepId,
}

impl StepKey {
    pub fn new(job_id: JobId, step_id: StepId) -> Self {
        Self { job_id, step_id }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_borrows_as_str_for_hashmap_lookup() {
        use std::collections::HashMap;
        let mut map: HashMap<JobId, u32> = HashMap::new();
        map.insert(JobId::from("100"), 1);
        assert_eq!(map.get("100"), Some(&1));
    }

    #[test]
    fn step_key_display_matches_job_dot_step() {
        let key = StepKey::new(JobId::from("100"), 0);
        assert_eq!(key.to_string(), "100.0");
    }
}
