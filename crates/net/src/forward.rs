//! Host-side port forwards into the guest.
//!
//! Each forward is a loopback TCP listener whose connections are spliced
//! onto stack-dialed guest connections. The table is editable at runtime
//! through the control mux.

use crate::error::{NetError, Result};
use crate::stack::VirtualNetwork;
use std::collections::BTreeMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Entry {
    remote: String,
    task: JoinHandle<()>,
}

/// Live set of host forwards, keyed by the local address string.
#[derive(Clone)]
pub struct ForwardTable {
    vn: VirtualNetwork,
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl ForwardTable {
    pub fn new(vn: VirtualNetwork) -> Self {
        Self {
            vn,
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Binds `local` and forwards every connection to `remote` inside the
    /// virtual network.
    pub async fn expose(&self, local: &str, remote: &str) -> Result<()> {
        let local_addr: SocketAddr = local
            .parse()
            .map_err(|_| NetError::InvalidForward(local.to_string()))?;
        let remote_addr: SocketAddrV4 = remote
            .parse()
            .map_err(|_| NetError::InvalidForward(remote.to_string()))?;

        let mut entries = self.entries.lock().await;
        if entries.contains_key(local) {
            return Err(NetError::InvalidForward(format!(
                "{local} is already exposed"
            )));
        }

        let listener = TcpListener::bind(local_addr).await?;
        let vn = self.vn.clone();
        let guest_port = remote_addr.port();

        let task = tokio::spawn(async move {
            loop {
                let (mut conn, peer) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("forward accept failed: {e}");
                        break;
                    }
                };

                let vn = vn.clone();
                tokio::spawn(async move {
                    match vn.dial_guest(guest_port).await {
                        Ok(mut guest) => {
                            tracing::debug!("forwarding {peer:?} to guest:{guest_port}");
                            let _ = tokio::io::copy_bidirectional(&mut conn, &mut guest).await;
                        }
                        Err(e) => {
                            tracing::warn!("dial guest:{guest_port} failed: {e}");
                        }
                    }
                });
            }
        });

        entries.insert(
            local.to_string(),
            Entry {
                remote: remote.to_string(),
                task,
            },
        );
        Ok(())
    }

    /// Stops forwarding `local`.
    pub async fn unexpose(&self, local: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        match entries.remove(local) {
            Some(entry) => {
                entry.task.abort();
                Ok(())
            }
            None => Err(NetError::InvalidForward(format!("{local} is not exposed"))),
        }
    }

    /// Snapshot of all active forwards, `local -> remote`.
    pub async fn list(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .await
            .iter()
            .map(|(local, entry)| (local.clone(), entry.remote.clone()))
            .collect()
    }

    /// Stops every forward.
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.iter() {
            entry.task.abort();
        }
        entries.clear();
    }
}
