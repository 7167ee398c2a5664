//! Guest clock resynchronization.
//!
//! The guest dials the sync-time socket once at boot and keeps the
//! connection open. Each `sync_time` tick pushes one length-prefixed
//! `date -s @<unix>` command through it.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::group::TaskGroup;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

/// Frames a shell command for the guest agent: 16-bit little-endian
/// length, then the ASCII bytes.
pub fn frame_command(command: &str) -> Vec<u8> {
    let len = command.len() as u16;
    let mut frame = Vec::with_capacity(2 + command.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(command.as_bytes());
    frame
}

/// Starts the sync-time server: one accept task that pins the guest
/// connection, one drain task that writes a frame per tick.
pub fn setup(group: &TaskGroup, ctx: &Ctx) -> Result<()> {
    let listener = UnixListener::bind(&ctx.paths.sync_time_socket)
        .map_err(|e| Error::Other(format!("listen time sync socket file error: {e}")))?;

    let conn: Arc<Mutex<Option<UnixStream>>> = Arc::new(Mutex::new(None));

    {
        let conn = conn.clone();
        let cancel = group.cancel_token();
        group.spawn("time-sync-accept", async move {
            tracing::info!("waiting for time sync connection");
            tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = accepted
                        .map_err(|e| Error::Other(format!("accept time sync socket error: {e}")))?;
                    tracing::info!("time sync connected");
                    conn.lock().await.replace(stream);
                    Ok(())
                }
            }
        });
    }

    {
        let signals = ctx.signals.clone();
        let cancel = group.cancel_token();
        group.spawn("time-sync", async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("cancel sync time event receive");
                        return Ok(());
                    }
                    tick = signals.receive_sync_time() => {
                        if !tick {
                            return Ok(());
                        }
                    }
                }

                let mut guard = conn.lock().await;
                let Some(stream) = guard.as_mut() else {
                    // The guest never connected; nothing to sync yet.
                    continue;
                };

                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                let frame = frame_command(&format!("date -s @{now}"));

                stream
                    .write_all(&frame)
                    .await
                    .map_err(|e| Error::Other(format!("write time sync command error: {e}")))?;
                tracing::info!("sync time success");
            }
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_little_endian_length_plus_ascii() {
        let frame = frame_command("date -s @1700000000");
        let expected_len = "date -s @1700000000".len() as u16;

        assert_eq!(&frame[0..2], &expected_len.to_le_bytes());
        assert_eq!(&frame[2..], b"date -s @1700000000");
    }

    #[test]
    fn frame_length_matches_payload_exactly() {
        let frame = frame_command("date -s @0");
        let len = u16::from_le_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(frame.len(), 2 + len);
    }

    mod end_to_end {
        use super::*;
        use crate::events::Events;
        use crate::signals::Signals;
        use podvm_core::{DerivedPaths, InstanceConfig, SshIdentity, Versions};
        use std::sync::atomic::AtomicBool;
        use tokio::io::AsyncReadExt;

        fn ctx(tmp: &std::path::Path) -> Ctx {
            let config = InstanceConfig {
                name: "default".to_string(),
                cpus: 1,
                memory_bytes: 1,
                kernel_src: tmp.join("k"),
                initrd_src: tmp.join("i"),
                rootfs_src: tmp.join("r"),
                target_dir: tmp.join("t"),
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
                    public_key: String::new(),
                },
                ssh_port: 2233,
                signals: Signals::new(),
                events: Events::disabled(),
                power_save: Arc::new(AtomicBool::new(false)),
            }
        }

        #[tokio::test]
        async fn wake_tick_produces_one_framed_date_command() {
            let tmp = tempfile::tempdir().unwrap();
            let ctx = ctx(tmp.path());
            let group = TaskGroup::new();

            setup(&group, &ctx).unwrap();

            // Guest side connects and waits for a frame.
            let mut guest = tokio::net::UnixStream::connect(&ctx.paths.sync_time_socket)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;

            ctx.signals.notify_sync_time();

            let mut header = [0u8; 2];
            tokio::time::timeout(
                std::time::Duration::from_secs(2),
                guest.read_exact(&mut header),
            )
            .await
            .expect("frame must arrive promptly")
            .unwrap();

            let len = u16::from_le_bytes(header) as usize;
            let mut payload = vec![0u8; len];
            guest.read_exact(&mut payload).await.unwrap();

            let command = String::from_utf8(payload).unwrap();
            assert!(command.starts_with("date -s @"));
            assert!(command["date -s @".len()..].parse::<u64>().is_ok());

            group.cancel();
            group.wait().await.unwrap();
        }
    }
}
