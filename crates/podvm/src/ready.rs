//! Guest ready barrier.
//!
//! The guest's ready unit dials vsock port 1026 once boot completes; the
//! proxy hands that to us on the ready socket. One line of input flips
//! the `vm_ready` barrier.

use crate::accept::accept_timeout;
use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::events::AppEvent;
use crate::group::TaskGroup;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds the ready socket and arms the barrier task.
pub fn arm(group: &TaskGroup, ctx: &Ctx) -> Result<()> {
    let listener = UnixListener::bind(&ctx.paths.ready_socket)
        .map_err(|e| Error::Other(format!("create ready socket error: {e}")))?;

    let ctx = ctx.clone();
    let cancel = group.cancel_token();
    group.spawn("ready", async move {
        let conn = accept_timeout(listener, &cancel, ACCEPT_TIMEOUT, "ready accept")
            .await
            .map_err(|e| Error::Other(format!("ready accept timeout: {e}")))?;

        let mut line = String::new();
        BufReader::new(conn)
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Other(format!("read ready failed: {e}")))?;

        ctx.signals.notify_vm_ready();
        ctx.events.notify_app(AppEvent::Ready);
        Ok(())
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Events;
    use crate::signals::Signals;
    use podvm_core::{DerivedPaths, InstanceConfig, SshIdentity, Versions};
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio::io::AsyncWriteExt;

    fn ctx(tmp: &Path) -> Ctx {
        let config = InstanceConfig {
            name: "default".to_string(),
            cpus: 1,
            memory_bytes: 1,
            kernel_src: tmp.join("bzImage"),
            initrd_src: tmp.join("initrd"),
            rootfs_src: tmp.join("rootfs"),
            target_dir: tmp.join("target"),
            socket_dir: tmp.to_path_buf(),
            ssh_key_dir: tmp.join("keys"),
            log_dir: tmp.join("logs"),
            versions: Versions::parse("kernel=1,initrd=1,rootfs=1,data=1").unwrap(),
            event_socket: None,
            cli_mode: false,
            bind_pid: 0,
            power_save: false,
            kernel_debug: false,
            extend_share_dirs: Vec::new(),
        };
        let paths = DerivedPaths::derive(&config).unwrap();
        Ctx {
            config: Arc::new(config),
            paths: Arc::new(paths),
            identity: SshIdentity {
                private_key_path: tmp.join("key"),
                public_key_path: tmp.join("key.pub"),
                private_key: String::new(),
                public_key: "ssh-ed25519 AAAA".to_string(),
            },
            ssh_port: 2233,
            signals: Signals::new(),
            events: Events::disabled(),
            power_save: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn ready_line_flips_the_barrier() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let group = TaskGroup::new();

        arm(&group, &ctx).unwrap();

        let mut guest = tokio::net::UnixStream::connect(&ctx.paths.ready_socket)
            .await
            .unwrap();
        guest.write_all(b"Ready\n").await.unwrap();

        assert!(ctx.signals.receive_vm_ready().await);
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_the_barrier_task() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ctx(tmp.path());
        let group = TaskGroup::new();

        arm(&group, &ctx).unwrap();
        group.cancel();

        // The task fails with a cancellation-shaped error.
        let err = group.wait().await.unwrap_err();
        assert!(err.to_string().contains("ready accept"));
    }
}
