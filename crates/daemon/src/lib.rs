// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Library surface for `agentd`: `main.rs` is a thin binary wrapper around
//! `run()`; everything else lives here so the root `agentd-specs` package's
//! integration tests can drive the dispatcher's public entry points
//! in-process instead of needing `assert_cmd` to shell out to a built
//! binary (no CLI surface to drive one against — see `DESIGN.md`).

pub mod context;
pub mod dispatcher;
pub mod env;
pub mod handlers;
pub mod spool;
pub mod supervisor_link;
pub mod uplink;

use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};

use context::AgentContext;
use env::Config;

/// Set by the SIGTERM/SIGINT handler installed in `install_signal_handlers`;
/// polled by `run`'s join-and-shutdown tail (spec §5: "the agent has one
/// global 'shutdown' atomic; SIGTERM/SIGINT set it").
static SIGNALED_SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown_signal(_signum: std::os::raw::c_int) {
    SIGNALED_SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), agentd_core::AgentError> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let handler = SigAction::new(SigHandler::Handler(on_shutdown_signal), SaFlags::empty(), SigSet::empty());
    // SAFETY: `on_shutdown_signal` only stores to an atomic, which is
    // async-signal-safe; no allocation, locking, or syscalls occur in the
    // handler itself.
    unsafe {
        sigaction(Signal::SIGTERM, &handler).map_err(|e| agentd_core::AgentError::FatalConfig(format!("sigaction(SIGTERM): {e}")))?;
        sigaction(Signal::SIGINT, &handler).map_err(|e| agentd_core::AgentError::FatalConfig(format!("sigaction(SIGINT): {e}")))?;
    }
    Ok(())
}

// The process-wide fork-mutex (spec §4.4/§5: "a single fork-mutex is
// installed via the platform's fork-handler hook so that library-internal
// locks cannot deadlock across a fork") lives on `AgentContext` itself
// (`fork_mutex`) rather than as a libc atfork hook: every `fork()` this
// process makes already runs underneath a call that locks it first (see
// `handlers::run_batch_launch`/`run_launch_tasks` and
// `agentd_bcast::ForkingOpener`), so there is no second call site an
// external atfork hook would need to guard against.

pub fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::EnvFilter;

    let log_dir = config.spool_dir.join("log");
    let _ = std::fs::create_dir_all(&log_dir);
    let appender = tracing_appender::rolling::daily(&log_dir, "agentd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env("AGENTD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).try_init();
    guard
}

/// Runs the daemon end to end: load config, recover durable state, open the
/// listening socket, hand off to the dispatcher and uplink threads, block
/// until asked to shut down. Exit-code mapping lives in `main.rs`.
pub fn run() -> Result<i32, agentd_core::AgentError> {
    let config = Config::from_env()?;
    let _log_guard = init_tracing(&config);

    tracing::info!(node = %config.node_name, cluster = %config.cluster_name, "agentd starting");

    std::fs::create_dir_all(&config.spool_dir).map_err(|e| agentd_core::AgentError::FatalConfig(format!("creating spool dir: {e}")))?;

    install_signal_handlers()?;

    let ctx = AgentContext::build(config)?;

    let recovered = spool::scan(&ctx.config.spool_dir, &ctx.config.node_name, &ctx.steps)
        .map_err(|e| agentd_core::AgentError::FatalConfig(format!("spool scan: {e}")))?;
    tracing::info!(recovered_steps = recovered, "spool scan complete");

    if ctx.config.socket_path.exists() {
        let _ = std::fs::remove_file(&ctx.config.socket_path);
    }
    if let Some(parent) = ctx.config.socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| agentd_core::AgentError::FatalConfig(format!("creating socket dir: {e}")))?;
    }
    let listener = UnixListener::bind(&ctx.config.socket_path)
        .map_err(|e| agentd_core::AgentError::FatalConfig(format!("binding {}: {e}", ctx.config.socket_path.display())))?;

    let uplink_ctx = ctx.clone();
    let uplink_handle = std::thread::spawn(move || uplink::run(uplink_ctx));

    let dispatcher_ctx = ctx.clone();
    let dispatcher_handle = std::thread::spawn(move || {
        if let Err(e) = dispatcher::serve(dispatcher_ctx, listener) {
            tracing::error!(error = %e, "dispatcher accept loop exited with an error");
        }
    });

    // Poll the signal flag and propagate it onto the shared shutdown
    // atomic; the dispatcher's accept loop and the uplink's select! loop
    // both check `ctx.is_shutting_down()` on their own cadence (spec §5:
    // "the acceptor breaks its loop on the next iteration").
    while !SIGNALED_SHUTDOWN.load(Ordering::SeqCst) && !ctx.is_shutting_down() {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    ctx.request_shutdown();
    tracing::info!("shutdown requested, waiting for dispatcher and uplink to drain");

    // Wake the blocking accept loop: connecting to our own socket is
    // enough to unstick a `listener.incoming()` iteration so it can
    // observe the shutdown flag on its next pass.
    let _ = std::os::unix::net::UnixStream::connect(&ctx.config.socket_path);

    let _ = dispatcher_handle.join();
    let _ = uplink_handle.join();
    let _ = std::fs::remove_file(&ctx.config.socket_path);

    tracing::info!("agentd exited cleanly");
    Ok(0)
}
