//! Host power monitor: sleep/wake notifications drive pause/resume or a
//! guest clock resync, depending on power-save mode.

#![cfg(target_os = "macos")]

use crate::context::Ctx;
use crate::error::Result;
use crate::group::TaskGroup;
use crate::timesync;
use block2::RcBlock;
use dispatch2::run_on_main;
use objc2::rc::Retained;
use objc2_app_kit::{
    NSWorkspace, NSWorkspaceDidWakeNotification, NSWorkspaceWillSleepNotification,
};
use objc2_foundation::{NSNotification, NSOperationQueue};
use podvm_vz::VmHandle;
use std::ptr::NonNull;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Awake,
    Sleep,
}

/// Starts the time-sync server and subscribes to host sleep/wake.
pub fn setup(group: &TaskGroup, ctx: &Ctx, vm: VmHandle) -> Result<()> {
    timesync::setup(group, ctx)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    register_observers(events_tx);
    tracing::info!("power monitor started");

    spawn_monitor(group, ctx.clone(), vm, events_rx);
    Ok(())
}

fn spawn_monitor(
    group: &TaskGroup,
    ctx: Ctx,
    vm: VmHandle,
    mut events: mpsc::UnboundedReceiver<PowerEvent>,
) {
    let cancel = group.cancel_token();
    group.spawn("power-monitor", async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("power monitor stopped");
                    return Ok(());
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::info!("listen power monitor event exited");
                        return Ok(());
                    }
                },
            };

            let power_save = ctx.power_save();
            tracing::info!("os {event:?}, power save mode: {power_save}");

            match event {
                PowerEvent::Awake if !power_save => {
                    tracing::info!("not power save mode, notify sync time");
                    ctx.signals.notify_sync_time();
                }
                PowerEvent::Awake => {
                    if !vm.capabilities().can_resume {
                        tracing::warn!("VM can not resume, current state: {}", vm.state());
                        continue;
                    }
                    match vm.resume().await {
                        Ok(()) => tracing::info!("resume VM success"),
                        Err(e) => tracing::warn!("resume VM failed: {e}"),
                    }
                }
                PowerEvent::Sleep => {
                    if !power_save {
                        continue;
                    }
                    if !vm.capabilities().can_pause {
                        tracing::warn!("VM can not pause, current state: {}", vm.state());
                        continue;
                    }
                    match vm.pause().await {
                        Ok(()) => tracing::info!("pause VM success"),
                        Err(e) => tracing::warn!("pause VM failed: {e}"),
                    }
                }
            }
        }
    });
}

/// Registers NSWorkspace sleep/wake observers delivering onto the main
/// queue. The observer tokens live for the process lifetime.
fn register_observers(events: mpsc::UnboundedSender<PowerEvent>) {
    run_on_main(move |_mtm| {
        // SAFETY: main thread; observer blocks only touch the Send
        // channel sender they capture.
        unsafe {
            let center = NSWorkspace::sharedWorkspace().notificationCenter();
            let queue = NSOperationQueue::mainQueue();

            let sleep_events = events.clone();
            let sleep_block = RcBlock::new(move |_note: NonNull<NSNotification>| {
                let _ = sleep_events.send(PowerEvent::Sleep);
            });
            let wake_block = RcBlock::new(move |_note: NonNull<NSNotification>| {
                let _ = events.send(PowerEvent::Awake);
            });

            let sleep_token = center.addObserverForName_object_queue_usingBlock(
                Some(NSWorkspaceWillSleepNotification),
                None,
                Some(&queue),
                &sleep_block,
            );
            let wake_token = center.addObserverForName_object_queue_usingBlock(
                Some(NSWorkspaceDidWakeNotification),
                None,
                Some(&queue),
                &wake_block,
            );

            let _ = Retained::into_raw(sleep_token);
            let _ = Retained::into_raw(wake_token);
        }
    });
}
