//! Ignition: the one-shot provisioning command handed to the guest
//! initrd over its vsock port.

use crate::accept::accept_timeout;
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::events::AppEvent;
use crate::group::TaskGroup;
use crate::mounts::Mounts;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);
const TZ_DB_PREFIX: &str = "/var/db/timezone/zoneinfo";

/// Composes the single shell command the initrd executes: fstab seeding,
/// authorized_keys, the ready trigger, and the timezone link.
pub fn compose_command(mounts: &Mounts, public_key: &str, now_unix: i64, local_tz: &str) -> String {
    let mut fstab = String::new();
    for line in mounts.fstab_lines() {
        fstab.push_str(&line);
        fstab.push_str(r"\\n");
    }

    let mount = format!("echo -e {fstab} >> /mnt/overlay/etc/fstab");
    let authorized_keys = format!(
        "mkdir -p /mnt/overlay/root/.ssh; echo {public_key} >> /mnt/overlay/root/.ssh/authorized_keys"
    );
    let ready = format!(
        "echo -e \"date -s @{now_unix};\\\\necho Ready | socat -v -d -d - VSOCK-CONNECT:2:1026\" > /mnt/overlay/opt/ready.command"
    );
    let tz = format!(
        "ln -sf /usr/share/zoneinfo/{local_tz} /mnt/overlay/etc/localtime; echo {local_tz} > /mnt/overlay/etc/timezone"
    );

    format!("{mount}; {authorized_keys}; {ready}; {tz}")
}

/// The host timezone, read from the `/etc/localtime` symlink target.
pub fn local_timezone() -> Result<String> {
    let target = std::fs::read_link("/etc/localtime")
        .map_err(|e| Error::Other(format!("readlink /etc/localtime failed: {e}")))?;
    let target = target.to_string_lossy();
    Ok(target
        .strip_prefix(TZ_DB_PREFIX)
        .unwrap_or(&target)
        .to_string())
}

/// Arms the ignition listener: one accepted connection gets the composed
/// command, then the socket closes.
pub async fn ignite(group: &TaskGroup, ctx: &Ctx, mounts: &Mounts) -> Result<()> {
    let listener = UnixListener::bind(&ctx.paths.initrd_vsock_socket)
        .map_err(|e| Error::Other(format!("listen ignition socket failed: {e}")))?;

    let now_unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let command = compose_command(mounts, &ctx.identity.public_key, now_unix, &local_timezone()?);

    let ctx = ctx.clone();
    let cancel = group.cancel_token();
    group.spawn("ignition", async move {
        let mut conn = accept_timeout(listener, &cancel, ACCEPT_TIMEOUT, "ignition accept")
            .await
            .inspect_err(|e| tracing::error!("ignition accept failed: {e}"))?;

        // Keep the first meaningful error; the close error only matters
        // when the write went through.
        let mut first_err: Option<Error> = None;

        if let Err(e) = conn.write_all(command.as_bytes()).await {
            tracing::error!("write ignition command failed: {e}");
            first_err = Some(e.into());
        } else {
            tracing::info!("write ignition command success");
            ctx.events.notify_app(AppEvent::IgnitionDone);
        }

        if let Err(e) = conn.shutdown().await {
            tracing::error!("close ignition connection failed: {e}");
            if first_err.is_none() {
                first_err = Some(e.into());
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    Ok(())
}
