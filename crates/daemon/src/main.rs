// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry point for `agentd`, the per-node job execution agent (spec §2).
//! Everything beyond exit-code mapping lives in `lib.rs`, so the root
//! integration-test package can drive the same `run`/dispatcher surface
//! in-process without shelling out to this binary.

/// Exit codes (spec §6): `0` clean shutdown, `1` init failure, `2`
/// unrecoverable runtime error. `agentd::run` only ever returns `Err` for
/// `FatalConfigError`-kind failures (everything else is caught and logged
/// inside the dispatcher/uplink loops per spec §7's propagation policy), so
/// any `Err` here maps to exit code 1.
fn main() {
    match agentd::run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("agentd: fatal: {e}");
            std::process::exit(1);
        }
    }
}
