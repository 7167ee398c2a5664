//! Bind-pid watcher and the signal gate.

use crate::error::Error;
use crate::group::TaskGroup;
use podvm_core::process;
use std::time::Duration;

/// Fails the scope once the bound pid disappears. With pid 0 the watcher
/// just parks until cancellation.
pub fn spawn_bind_pid_watcher(group: &TaskGroup, pid: i32) {
    let cancel = group.cancel_token();
    group.spawn("bind-pid", async move {
        if pid == 0 {
            tracing::info!("pid is 0, no need to wait");
            cancel.cancelled().await;
            return Ok(());
        }

        tracing::info!("wait bind pid: {pid} exit");
        loop {
            if cancel.is_cancelled() {
                tracing::info!("cancel wait bind pid, because scope done");
                return Ok(());
            }
            if !process::alive(pid) {
                tracing::info!("bind pid: {pid} exited");
                return Err(Error::BindPidDead(pid));
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    });
}

/// Translates the first SIGINT/SIGTERM into a scope-cancelling error.
pub fn spawn_signal_gate(group: &TaskGroup) {
    let cancel = group.cancel_token();
    group.spawn("signal-gate", async move {
        let mut interrupt = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            _ = interrupt.recv() => Err(Error::Signal("SIGINT")),
            _ = terminate.recv() => Err(Error::Signal("SIGTERM")),
            _ = cancel.cancelled() => Ok(()),
        }
    });
}

/// Broken event or vsock peers must surface as write errors, not kill
/// the process.
pub fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN for SIGPIPE is async-signal-safe and has
    // no handler to race with.
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }
}
