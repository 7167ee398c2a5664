//! SSH auth socket proxy.
//!
//! The guest and CLI tooling talk to `<name>-ssh-auth.sock`; when the
//! user has a real agent we splice onto it, otherwise connections are
//! accepted and closed so clients fail fast instead of hanging.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

const KNOWN_AGENT_PATHS: &[&str] = &[".1password/agent.sock"];

/// Locates the user's live SSH agent socket, if any: the environment
/// first, then well-known paths, then launchd.
pub async fn find_extended_agent() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("SSH_AUTH_SOCK") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    if let Some(home) = std::env::var_os("HOME") {
        for known in KNOWN_AGENT_PATHS {
            let path = Path::new(&home).join(known);
            if path.exists() {
                return Some(path);
            }
        }
    }

    let output = tokio::process::Command::new("/bin/launchctl")
        .args(["asuser", &nix::unistd::getuid().to_string()])
        .args(["launchctl", "getenv", "SSH_AUTH_SOCK"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    path.exists().then_some(path)
}

/// The proxy listener plus its accept task.
pub struct AgentProxy {
    socket_path: PathBuf,
    task: JoinHandle<()>,
}

impl AgentProxy {
    pub async fn start(socket_path: &Path) -> Result<Self> {
        let upstream = find_extended_agent().await;
        match &upstream {
            Some(path) => tracing::info!("found extended agent: {}", path.display()),
            None => tracing::info!("no extended ssh agent found"),
        }
        Self::start_with_upstream(socket_path, upstream)
    }

    fn start_with_upstream(socket_path: &Path, upstream: Option<PathBuf>) -> Result<Self> {
        let listener = UnixListener::bind(socket_path)
            .map_err(|e| Error::Other(format!("create ssh auth socket error: {e}")))?;

        let task = tokio::spawn(async move {
            loop {
                let (conn, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("ssh auth accept error: {e}");
                        return;
                    }
                };

                let Some(upstream) = upstream.clone() else {
                    // No agent to answer; closing is kinder than hanging.
                    drop(conn);
                    continue;
                };

                tokio::spawn(async move {
                    let mut conn = conn;
                    match UnixStream::connect(&upstream).await {
                        Ok(mut agent) => {
                            let _ = tokio::io::copy_bidirectional(&mut conn, &mut agent).await;
                        }
                        Err(e) => {
                            tracing::warn!("dial extended agent failed: {e}");
                        }
                    }
                });
            }
        });

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            task,
        })
    }

    /// Stops accepting and removes the socket file. Safe to call more
    /// than once.
    pub fn close(&self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("remove ssh auth socket failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn proxy_splices_to_an_upstream_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let upstream_path = tmp.path().join("upstream.sock");
        let proxy_path = tmp.path().join("proxy.sock");

        // Fake agent echoing one request back.
        let upstream = UnixListener::bind(&upstream_path).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let proxy = AgentProxy::start_with_upstream(&proxy_path, Some(upstream_path)).unwrap();

        let mut client = UnixStream::connect(&proxy_path).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        proxy.close();
        assert!(!proxy_path.exists());
    }

    #[tokio::test]
    async fn without_upstream_connections_are_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy_path = tmp.path().join("lonely.sock");

        let proxy = AgentProxy::start_with_upstream(&proxy_path, None).unwrap();

        let mut client = UnixStream::connect(&proxy_path).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        proxy.close();
    }

    #[tokio::test]
    async fn close_twice_is_harmless() {
        let tmp = tempfile::tempdir().unwrap();
        let proxy =
            AgentProxy::start_with_upstream(&tmp.path().join("twice.sock"), None).unwrap();
        proxy.close();
        proxy.close();
    }
}
