//! VM driver: builds the device graph, boots the guest, and owns its
//! lifecycle from first barrier to stop protocol.

#![cfg(target_os = "macos")]

use crate::cmdline::{Arch, kernel_cmdline};
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::events::AppEvent;
use crate::group::TaskGroup;
use crate::ignition;
use crate::mounts::Mounts;
use crate::power;
use crate::restful;
use podvm_vz::{Device, VmHandle, VmSpec, VmState, connect_vsocks};
use std::time::Duration;
use tokio::sync::watch;

const GVPROXY_READY_TIMEOUT: Duration = Duration::from_secs(10);
const VM_RUNNING_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_POLL: Duration = Duration::from_millis(500);

pub const VSOCK_PORT_NETWORK: u32 = 1024;
pub const VSOCK_PORT_INITRD: u32 = 1025;
pub const VSOCK_PORT_READY: u32 = 1026;

/// Builds the device graph for an instance. Block order is load-bearing:
/// rootfs must surface as vda, tmp as vdb, data as vdc.
pub fn build_spec(ctx: &Ctx, mounts: &Mounts, cmdline: String) -> VmSpec {
    let paths = &ctx.paths;
    let mut devices = vec![
        Device::Block {
            path: paths.rootfs.clone(),
            read_only: false,
        },
        Device::Block {
            path: paths.tmp_disk.clone(),
            read_only: false,
        },
        Device::Block {
            path: paths.data_disk.clone(),
            read_only: false,
        },
        Device::Vsock {
            port: VSOCK_PORT_NETWORK,
            socket_path: paths.network_socket.clone(),
        },
        Device::Vsock {
            port: VSOCK_PORT_INITRD,
            socket_path: paths.initrd_vsock_socket.clone(),
        },
        Device::Vsock {
            port: VSOCK_PORT_READY,
            socket_path: paths.ready_socket.clone(),
        },
    ];

    if ctx.config.cli_mode {
        devices.push(Device::SerialStdio);
    } else {
        devices.push(Device::SerialFile {
            path: ctx
                .config
                .log_dir
                .join(format!("{}-vm.log", ctx.config.name)),
        });
    }

    for mount in mounts.iter() {
        devices.push(Device::Fs {
            tag: mount.tag.clone(),
            share_dir: mount.share_dir.clone(),
        });
    }

    devices.push(Device::Rng);

    VmSpec {
        cpus: ctx.config.cpus,
        memory_bytes: ctx.config.memory_bytes,
        kernel: paths.kernel.clone(),
        initrd: paths.initrd.clone(),
        cmdline,
        devices,
    }
}

/// Runs the VM through its whole lifecycle. Spawned tasks inherit the
/// group's scope; a failure anywhere collapses the graph.
pub async fn run(group: &TaskGroup, ctx: &Ctx) -> Result<()> {
    let mut mounts = Mounts::defaults();
    for (tag, dir) in &ctx.config.extend_share_dirs {
        mounts.extend(tag, dir)?;
    }

    let cmdline = kernel_cmdline(Arch::host(), ctx.config.cli_mode, ctx.config.kernel_debug);
    tracing::info!(
        "bootloader: kernel='{}', initrd='{}', cmdline='{cmdline}'",
        ctx.paths.kernel.display(),
        ctx.paths.initrd.display()
    );
    tracing::info!(
        "vm cpu: {}, memory: {}",
        ctx.config.cpus,
        ctx.config.memory_bytes / 1024 / 1024
    );

    let spec = build_spec(ctx, &mounts, cmdline);
    tracing::info!(
        "block devices: vda: '{}', vdb: '{}', vdc: '{}'",
        ctx.paths.rootfs.display(),
        ctx.paths.tmp_disk.display(),
        ctx.paths.data_disk.display()
    );

    let vm = VmHandle::create(&spec).inspect_err(|e| {
        tracing::error!("creating virtual machine failed: {e}");
    })?;

    restful::serve(group, ctx, vm.clone())?;

    let cancel = group.cancel_token();
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::info!("skip start VM, because scope done");
            return Ok(());
        }
        _ = tokio::time::sleep(GVPROXY_READY_TIMEOUT) => {
            tracing::error!("timeout waiting for gvproxy to start");
            return Err(Error::Timeout("gvproxy to start"));
        }
        ready = ctx.signals.receive_gvproxy_ready() => {
            if !ready {
                return Ok(());
            }
            tracing::info!("gvproxy is ready, start VM");
        }
    }

    power::setup(group, ctx, vm.clone())?;

    // Republish state transitions: the watch holds the latest state for
    // the waiters below; Resuming additionally triggers a time resync.
    let mut state_events = vm
        .take_events()
        .ok_or_else(|| Error::Other("VM state events already taken".to_string()))?;
    vm.spawn_state_sampler(cancel.clone());

    let (state_tx, state_rx) = watch::channel(VmState::Starting);
    {
        let signals = ctx.signals.clone();
        let cancel = cancel.clone();
        group.spawn("vm-state", async move {
            loop {
                let state = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    state = state_events.recv() => match state {
                        Some(state) => state,
                        None => return Ok(()),
                    },
                };

                if state == VmState::Resuming {
                    signals.notify_sync_time();
                }

                let terminal = matches!(state, VmState::Stopped | VmState::Error);
                let _ = state_tx.send(state);
                if terminal {
                    tracing::info!(
                        "stop listening VM state, because VM interruption, current state is: {state}"
                    );
                    return Ok(());
                }
            }
        });
    }

    vm.start().await?;
    ctx.events.notify_app(AppEvent::IgnitionProgress);

    ignition::ignite(group, ctx, &mounts)
        .await
        .inspect_err(|e| tracing::error!("ignition failed: {e}"))?;

    wait_for_state(state_rx.clone(), VmState::Running, VM_RUNNING_TIMEOUT)
        .await
        .inspect_err(|e| tracing::error!("waiting for VM to start failed: {e}"))?;
    tracing::info!("virtual machine is running");

    {
        let vm = vm.clone();
        let vsocks = spec.vsock_devices();
        let cancel = cancel.clone();
        group.spawn("vsock-connectors", async move {
            let proxies = connect_vsocks(&vm, &vsocks)
                .inspect_err(|e| tracing::error!("connecting vsocks failed: {e}"))?;
            tracing::info!("vsocks are connected");

            cancel.cancelled().await;
            tracing::info!("cancel listen vsocks, because scope done");
            proxies.release();
            Ok(())
        });
    }

    {
        let mut state_rx = state_rx.clone();
        let cancel = cancel.clone();
        group.spawn("vm-terminal", async move {
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                changed = state_rx.wait_for(|s| matches!(s, VmState::Stopped | VmState::Error)) => {
                    match changed {
                        Ok(_) => {
                            tracing::warn!("VM is stopped");
                            Err(Error::VmStopped)
                        }
                        Err(_) => Ok(()),
                    }
                }
            }
        });
    }

    {
        let vm = vm.clone();
        let cancel = cancel.clone();
        group.spawn("vm-stopper", async move {
            cancel.cancelled().await;
            tracing::info!("stop VM, because scope done");

            if let Err(e) = stop_vm(&vm).await {
                tracing::error!("error stopping VM: {e}");
            } else {
                tracing::info!("VM is stopped in stop_vm");
            }
            Ok(())
        });
    }

    Ok(())
}

async fn wait_for_state(
    mut state_rx: watch::Receiver<VmState>,
    want: VmState,
    timeout: Duration,
) -> Result<()> {
    let waited = tokio::time::timeout(
        timeout,
        state_rx.wait_for(|s| *s == want || *s == VmState::Error),
    )
    .await;

    match waited {
        Ok(Ok(state)) if *state == want => Ok(()),
        Ok(Ok(_)) => Err(Error::Other(format!(
            "VM state is error, expected state: {want}"
        ))),
        Ok(Err(_)) => Err(Error::Other("VM state stream ended".to_string())),
        Err(_) => Err(Error::Timeout("VM Running")),
    }
}

/// Graceful-then-forceful stop: ask politely for up to ten seconds, then
/// force. `Stopped` and `Error` both count as done.
pub async fn stop_vm(vm: &VmHandle) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    let mut logged_stopping = false;

    let graceful = loop {
        if tokio::time::Instant::now() >= deadline {
            break false;
        }

        match vm.state() {
            VmState::Stopped => {
                tracing::info!("VM is already stopped");
                break true;
            }
            VmState::Stopping => {
                if !logged_stopping {
                    tracing::info!("VM state is stopping, waiting for it to stop");
                    logged_stopping = true;
                }
            }
            VmState::Error => {
                tracing::error!("VM is in error state in stop_vm");
                break true;
            }
            _ => {
                if vm.capabilities().can_request_stop {
                    tracing::info!("requesting VM to stop");
                    if let Err(e) = vm.request_stop() {
                        tracing::error!("requesting VM to stop failed: {e}");
                    }
                }
            }
        }

        tokio::time::sleep(STOP_POLL).await;
    };

    if graceful {
        return Ok(());
    }

    let state = vm.state();
    if matches!(state, VmState::Stopped | VmState::Error) {
        tracing::info!("VM stopped, state is: {state}");
        return Ok(());
    }

    tracing::info!("try to force stop VM, current state is: {state}");
    vm.stop()
        .await
        .inspect_err(|e| tracing::error!("force stop VM failed: {e}"))?;
    tracing::info!("force stop VM succeeded");
    Ok(())
}
