//! End-to-end supervision: bootstrap, the task graph, and the structured
//! shutdown protocol.

#![cfg(target_os = "macos")]

use crate::agent::AgentProxy;
use crate::bindpid;
use crate::context::Ctx;
use crate::driver;
use crate::error::{Error, Result};
use crate::events::{AppEvent, Events};
use crate::group::TaskGroup;
use crate::instance;
use crate::netstack;
use crate::ready;
use crate::signals::Signals;
use podvm_core::{DerivedPaths, InstanceConfig, SshIdentity, port, target};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

const SSH_PORT_RANGE_START: u16 = 2233;

/// Runs one supervised instance to completion and returns the process
/// exit code: 0 on a clean exit, 1 on any error or signal.
pub async fn run(config: InstanceConfig) -> i32 {
    bindpid::ignore_sigpipe();

    let config = Arc::new(config);
    let paths = match DerivedPaths::derive(&config) {
        Ok(paths) => Arc::new(paths),
        Err(e) => {
            eprintln!("derive paths error: {e}");
            return 1;
        }
    };

    let mut lock = match instance::make_single_instance(&paths.lock_file, &paths.executable).await
    {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("make single instance error: {e}");
            return 1;
        }
    };

    let (identity, ssh_port) = match setup(&config, &paths).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("setup error: {e}");
            lock.unlock();
            return 1;
        }
    };

    let ctx = Ctx {
        config: config.clone(),
        paths: paths.clone(),
        identity,
        ssh_port,
        signals: Signals::new(),
        events: Events::setup(config.event_socket.clone()),
        power_save: Arc::new(AtomicBool::new(config.power_save)),
    };

    let agent = match AgentProxy::start(&ctx.paths.ssh_auth_socket).await {
        Ok(agent) => agent,
        Err(e) => {
            tracing::error!("start ssh agent sock error: {e}");
            ctx.events.notify_error(&e);
            ctx.events.notify_exit().await;
            lock.unlock();
            ctx.signals.close();
            return 1;
        }
    };

    ctx.events.notify_app(AppEvent::Initializing);

    let result = launch(&ctx).await;

    let code = match result {
        Ok(()) => {
            tracing::info!("main exit");
            0
        }
        Err(e) => {
            if e.is_signal() {
                tracing::info!("shutting down: {e}");
            } else {
                tracing::error!("main error: {e}");
            }
            ctx.events.notify_error(&e);
            1
        }
    };

    // Teardown in reverse of acquisition: the terminal exit event first
    // (nothing may follow it), then the agent, the lock, the fabric.
    ctx.events.notify_exit().await;
    agent.close();
    lock.unlock();
    ctx.signals.close();

    code
}

/// Post-gate bootstrap: socket dir, SSH identity, host port, artifacts.
async fn setup(config: &Arc<InstanceConfig>, paths: &Arc<DerivedPaths>) -> Result<(SshIdentity, u16)> {
    DerivedPaths::reset_socket_dir(config)?;
    tokio::fs::create_dir_all(&config.log_dir).await?;

    let (identity, ()) = tokio::try_join!(
        async {
            SshIdentity::ensure(&config.ssh_key_dir, &config.name)
                .await
                .map_err(Error::from)
        },
        async {
            target::reconcile(config, paths).await.map_err(Error::from)
        },
    )?;

    let ssh_port = port::find_usable_port(SSH_PORT_RANGE_START)?;
    Ok((identity, ssh_port))
}

/// Spawns the whole task graph and waits for it to settle.
async fn launch(ctx: &Ctx) -> Result<()> {
    let group = TaskGroup::new();

    ready::arm(&group, ctx)?;

    bindpid::spawn_bind_pid_watcher(&group, ctx.config.bind_pid);

    {
        let group_handle = group.clone();
        let ctx = ctx.clone();
        group.spawn("gvproxy", async move {
            netstack::run(&group_handle, &ctx).await
        });
    }

    {
        let group_handle = group.clone();
        let ctx = ctx.clone();
        group.spawn("vm-driver", async move {
            driver::run(&group_handle, &ctx).await
        });
    }

    bindpid::spawn_signal_gate(&group);

    group.wait().await
}
