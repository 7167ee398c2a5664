//! Podman API socket forward.
//!
//! Once the guest is up, a host unix socket is bridged to the guest's
//! `/run/podman/podman.sock` through an SSH `direct-streamlocal` channel,
//! transported over a stack-dialed connection to the guest sshd.

use crate::error::Result;
use crate::ssh;
use crate::stack::VirtualNetwork;
use russh::client;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

const SSH_PORT: u16 = 22;
const SSH_USER: &str = "root";
const PODMAN_SOCKET: &str = "/run/podman/podman.sock";

/// Accepts connections on `socket_path` and tunnels each into the guest
/// podman socket until the scope is cancelled. The socket file is removed
/// on the way out.
pub async fn run_podman_forward(
    vn: VirtualNetwork,
    socket_path: &Path,
    private_key_path: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    let key = ssh::load_identity(private_key_path)?;

    let mut session: Option<client::Handle<ssh::Acceptor>> = None;

    let result = loop {
        let conn = tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => break Err(e.into()),
            },
        };

        // Reuse the session while it lives; dial a fresh one when it died.
        if session.as_ref().is_none_or(|s| s.is_closed()) {
            match connect(&vn, key.clone()).await {
                Ok(handle) => session = Some(handle),
                Err(e) => {
                    tracing::warn!("podman forward ssh connect failed: {e}");
                    continue;
                }
            }
        }

        let Some(handle) = session.as_ref() else {
            continue;
        };

        match handle.channel_open_direct_streamlocal(PODMAN_SOCKET).await {
            Ok(channel) => {
                tokio::spawn(async move {
                    let mut conn = conn;
                    let mut tunnel = channel.into_stream();
                    if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut tunnel).await {
                        tracing::debug!("podman tunnel ended: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::warn!("open podman channel failed: {e}");
                session = None;
            }
        }
    };

    let _ = std::fs::remove_file(socket_path);
    result
}

async fn connect(
    vn: &VirtualNetwork,
    key: Arc<russh::keys::PrivateKey>,
) -> Result<client::Handle<ssh::Acceptor>> {
    let transport = vn.dial_guest(SSH_PORT).await?;
    ssh::session_over(transport, SSH_USER, key).await
}
