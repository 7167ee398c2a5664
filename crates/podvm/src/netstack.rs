//! Network stack supervisor.
//!
//! Owns the virtual network for the instance: fixed addressing, the
//! control muxes, the SSH host forward, and the podman socket forward
//! that comes up once the guest reports ready.

use crate::context::Ctx;
use crate::error::Result;
use crate::events::AppEvent;
use crate::group::TaskGroup;
use podvm_net::{Forward, ForwardTable, NetworkConfig, VirtualNetwork};
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::UnixListener;

const GUEST_SSH_PORT: u16 = 22;
const GUEST_HTTP_PORT: u16 = 80;

/// Brings the network up and signals `gvproxy_ready` once both muxes are
/// listening.
pub async fn run(group: &TaskGroup, ctx: &Ctx) -> Result<()> {
    let mut net_config = NetworkConfig::default();
    net_config.dns_search_domains = podvm_net::host_search_domains();
    net_config.forwards = vec![Forward {
        local: SocketAddr::from(([127, 0, 0, 1], ctx.ssh_port)),
        remote: SocketAddrV4::new(net_config.guest_ip, GUEST_SSH_PORT),
    }];

    let (vn, stack) = VirtualNetwork::new(net_config);

    {
        let cancel = group.cancel_token();
        group.spawn("network-stack", async move {
            stack.run(cancel).await;
            Ok(())
        });
    }

    let forwards = ForwardTable::new(vn.clone());
    for forward in vn.config().forwards.clone() {
        forwards
            .expose(&forward.local.to_string(), &forward.remote.to_string())
            .await?;
    }

    tracing::info!("listening {}", ctx.paths.endpoint);
    let listener = UnixListener::bind(&ctx.paths.network_socket)?;
    {
        let vn = vn.clone();
        let forwards = forwards.clone();
        let cancel = group.cancel_token();
        group.spawn("network-control", async move {
            podvm_net::serve_control(listener, vn, forwards, cancel)
                .await
                .map_err(Into::into)
        });
    }

    let guest_conns = vn.listen_guest(GUEST_HTTP_PORT)?;
    {
        let forwards = forwards.clone();
        let cancel = group.cancel_token();
        group.spawn("network-guest-mux", async move {
            podvm_net::serve_guest_mux(guest_conns, forwards, cancel)
                .await
                .map_err(Into::into)
        });
    }

    ctx.signals.notify_gvproxy_ready();
    ctx.events.notify_app(AppEvent::GvProxyReady);

    {
        let ctx = ctx.clone();
        let cancel = group.cancel_token();
        group.spawn("podman-forward", async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("skip create ssh forward, because scope done");
                    return Ok(());
                }
                ready = ctx.signals.receive_vm_ready() => {
                    if !ready {
                        return Ok(());
                    }
                    tracing::info!("VM is ready, creating podman socket forward");
                }
            }

            podvm_net::run_podman_forward(
                vn,
                &ctx.paths.forward_socket,
                &ctx.identity.private_key_path,
                cancel,
            )
            .await
            .map_err(Into::into)
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Events;
    use crate::signals::Signals;
    use podvm_core::{DerivedPaths, InstanceConfig, SshIdentity, Versions};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ctx(tmp: &std::path::Path, ssh_port: u16) -> Ctx {
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
            ssh_port,
            signals: Signals::new(),
            events: Events::disabled(),
            power_save: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn network_comes_up_and_signals_readiness() {
        let tmp = tempfile::tempdir().unwrap();
        let ssh_port = podvm_core::port::find_usable_port(24500).unwrap();
        let ctx = ctx(tmp.path(), ssh_port);
        let group = TaskGroup::new();

        run(&group, &ctx).await.unwrap();
        assert!(ctx.signals.receive_gvproxy_ready().await);

        // The control mux answers, and the SSH forward is registered.
        let mut stream = tokio::net::UnixStream::connect(&ctx.paths.network_socket)
            .await
            .unwrap();
        stream
            .write_all(
                b"GET /services/forwarder/all HTTP/1.1\r\nhost: podvm\r\nconnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(&format!("127.0.0.1:{ssh_port}")));
        assert!(response.contains("192.168.127.2:22"));

        group.cancel();
        group.wait().await.unwrap();
    }
}
