//! The virtual network: one smoltcp interface polled on a timer, bridging
//! guest TCP flows onto in-process byte streams.
//!
//! The poll loop is synchronous; anything async (upstream DNS, the data
//! plane pump, consumers of guest streams) talks to it through channels.

use crate::config::NetworkConfig;
use crate::device::QueueDevice;
use crate::dhcp::StaticDhcp;
use crate::dns::{self, ZoneAnswer, ZoneResolver};
use crate::error::{NetError, Result};
use crate::frames;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    DhcpPacket, EthernetAddress, HardwareAddress, IpAddress, IpCidr, IpEndpoint,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A TCP flow to or from the guest, usable anywhere tokio IO is expected.
pub type GuestStream = DuplexStream;

const TCP_BUFFER: usize = 65536;
const DUPLEX_BUFFER: usize = 65536;
const LISTEN_BACKLOG: usize = 2;
const EPHEMERAL_FIRST: u16 = 49152;

enum Command {
    Dial {
        port: u16,
        reply: oneshot::Sender<Result<GuestStream>>,
    },
    Listen {
        port: u16,
        conns: mpsc::Sender<GuestStream>,
    },
}

/// Handle to a running [`StackTask`]. Cheap to clone.
#[derive(Clone)]
pub struct VirtualNetwork {
    config: Arc<NetworkConfig>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    frames_in: mpsc::UnboundedSender<Vec<u8>>,
    data_plane: Arc<Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>>,
}

impl VirtualNetwork {
    /// Builds the network and its poll task. The task must be spawned and
    /// driven for any of the handle's operations to make progress.
    pub fn new(config: NetworkConfig) -> (Self, StackTask) {
        let (frames_in_tx, frames_in_rx) = mpsc::unbounded_channel();
        let (frames_out_tx, frames_out_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        spawn_dns_resolver(jobs_rx, done_tx);

        let task = StackTask::new(config.clone(), frames_in_rx, frames_out_tx, cmd_rx, jobs_tx, done_rx);

        let handle = Self {
            config: Arc::new(config),
            cmd_tx,
            frames_in: frames_in_tx,
            data_plane: Arc::new(Mutex::new(Some(frames_out_rx))),
        };

        (handle, task)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Adopts an accepted connection as the guest data plane and pumps
    /// frames until it closes. At most one data plane is active at a time;
    /// when the pump ends the slot frees up for a reconnect.
    pub async fn attach_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut slot = self.data_plane.lock().await;
        let Some(mut from_stack) = slot.take() else {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "data plane already attached",
            )));
        };
        drop(slot);

        let to_stack = self.frames_in.clone();
        let slot = self.data_plane.clone();
        tokio::spawn(async move {
            if let Err(e) = frames::pump(stream, to_stack, &mut from_stack).await {
                tracing::info!("data plane detached: {e}");
            }
            // Drop frames queued while nobody was pumping.
            while from_stack.try_recv().is_ok() {}
            slot.lock().await.replace(from_stack);
        });

        Ok(())
    }

    /// Opens a TCP connection to `guest_ip:port` through the stack.
    pub async fn dial_guest(&self, port: u16) -> Result<GuestStream> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dial {
                port,
                reply: reply_tx,
            })
            .map_err(|_| NetError::StackGone)?;
        reply_rx.await.map_err(|_| NetError::StackGone)?
    }

    /// Starts accepting in-network TCP connections addressed to
    /// `gateway:port`.
    pub fn listen_guest(&self, port: u16) -> Result<mpsc::Receiver<GuestStream>> {
        let (conns_tx, conns_rx) = mpsc::channel(8);
        self.cmd_tx
            .send(Command::Listen {
                port,
                conns: conns_tx,
            })
            .map_err(|_| NetError::StackGone)?;
        Ok(conns_rx)
    }
}

struct Bridge {
    handle: SocketHandle,
    io: DuplexStream,
    /// Our side initiated close; waiting for the socket to drain.
    closing: bool,
}

struct Listener {
    port: u16,
    conns: mpsc::Sender<GuestStream>,
    handles: Vec<SocketHandle>,
}

/// Owns the smoltcp interface and sockets; runs until cancelled.
pub struct StackTask {
    config: NetworkConfig,
    device: QueueDevice,
    iface: Interface,
    sockets: SocketSet<'static>,
    dhcp: StaticDhcp,
    dhcp_handle: SocketHandle,
    dns_handle: SocketHandle,
    zones: ZoneResolver,
    dns_jobs: mpsc::UnboundedSender<DnsJob>,
    dns_done: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    dns_pending: HashMap<u64, IpEndpoint>,
    dns_token: u64,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    bridges: Vec<Bridge>,
    listeners: Vec<Listener>,
    next_port: u16,
    start: std::time::Instant,
}

type DnsJob = (u64, String, u16, Vec<u8>);

impl StackTask {
    fn new(
        config: NetworkConfig,
        frames_in: mpsc::UnboundedReceiver<Vec<u8>>,
        frames_out: mpsc::UnboundedSender<Vec<u8>>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        dns_jobs: mpsc::UnboundedSender<DnsJob>,
        dns_done: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    ) -> Self {
        let mut device = QueueDevice::new(config.mtu, frames_in, frames_out);
        let start = std::time::Instant::now();

        let hw_addr = HardwareAddress::Ethernet(EthernetAddress(config.gateway_mac));
        let mut iface = Interface::new(IfaceConfig::new(hw_addr), &mut device, smol_now(start));
        iface.update_ip_addrs(|addrs| {
            addrs
                .push(IpCidr::new(
                    IpAddress::Ipv4(config.gateway_ip.into()),
                    config.subnet_prefix,
                ))
                .ok();
            for &virtual_ip in &config.gateway_virtual_ips {
                addrs
                    .push(IpCidr::new(IpAddress::Ipv4(virtual_ip.into()), 32))
                    .ok();
            }
        });

        let mut sockets = SocketSet::new(vec![]);

        let mut dhcp_socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 4], vec![0u8; 1500 * 4]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 4], vec![0u8; 1500 * 4]),
        );
        dhcp_socket.bind(67).expect("bind DHCP socket");
        let dhcp_handle = sockets.add(dhcp_socket);

        let mut dns_socket = udp::Socket::new(
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 8], vec![0u8; 1500 * 8]),
            udp::PacketBuffer::new(vec![udp::PacketMetadata::EMPTY; 8], vec![0u8; 1500 * 8]),
        );
        dns_socket.bind(53).expect("bind DNS socket");
        let dns_handle = sockets.add(dns_socket);

        let dhcp = StaticDhcp::new(
            config.gateway_ip,
            config.subnet_prefix,
            &config.dhcp_static_leases,
        );
        let zones = ZoneResolver::new(config.dns_zones.clone());

        Self {
            config,
            device,
            iface,
            sockets,
            dhcp,
            dhcp_handle,
            dns_handle,
            zones,
            dns_jobs,
            dns_done,
            dns_pending: HashMap::new(),
            dns_token: 0,
            cmd_rx,
            bridges: Vec::new(),
            listeners: Vec::new(),
            next_port: EPHEMERAL_FIRST,
            start,
        }
    }

    /// Drives the interface until the scope is cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            self.tick();
        }
    }

    fn tick(&mut self) {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        self.drain_commands();
        self.device.pull_rx();

        let timestamp = smol_now(self.start);
        let _ = self
            .iface
            .poll(timestamp, &mut self.device, &mut self.sockets);

        self.service_dhcp();
        self.service_dns();
        self.service_listeners();
        self.service_bridges(&mut cx);

        // Flush anything the bridges queued this tick.
        let _ = self
            .iface
            .poll(timestamp, &mut self.device, &mut self.sockets);
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Dial { port, reply } => {
                    let _ = reply.send(self.dial(port));
                }
                Command::Listen { port, conns } => {
                    self.listeners.push(Listener {
                        port,
                        conns,
                        handles: Vec::new(),
                    });
                }
            }
        }
    }

    fn dial(&mut self, port: u16) -> Result<GuestStream> {
        let mut socket = tcp::Socket::new(
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
        );

        let local_port = self.alloc_port();
        let remote = (IpAddress::Ipv4(self.config.guest_ip.into()), port);
        socket
            .connect(self.iface.context(), remote, local_port)
            .map_err(|_| NetError::ConnectRefused(port))?;

        let handle = self.sockets.add(socket);
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        self.bridges.push(Bridge {
            handle,
            io: server,
            closing: false,
        });

        Ok(client)
    }

    fn alloc_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port == u16::MAX {
            EPHEMERAL_FIRST
        } else {
            self.next_port + 1
        };
        port
    }

    fn service_dhcp(&mut self) {
        let socket = self.sockets.get_mut::<udp::Socket>(self.dhcp_handle);

        let mut pending: Vec<(EthernetAddress, Vec<u8>)> = Vec::new();
        while let Ok((data, _meta)) = socket.recv() {
            if let Ok(packet) = DhcpPacket::new_checked(data) {
                pending.push((packet.client_hardware_address(), data.to_vec()));
            }
        }

        for (client_mac, data) in pending {
            let Ok(packet) = DhcpPacket::new_checked(&data[..]) else {
                continue;
            };
            let Some(reply) = self.dhcp.handle_packet(client_mac, &packet) else {
                continue;
            };

            let mut buf = vec![0u8; reply.buffer_len()];
            let mut out = DhcpPacket::new_unchecked(&mut buf[..]);
            if reply.emit(&mut out).is_err() {
                continue;
            }

            let socket = self.sockets.get_mut::<udp::Socket>(self.dhcp_handle);
            let dest = IpEndpoint::new(
                IpAddress::Ipv4(std::net::Ipv4Addr::BROADCAST.into()),
                68,
            );
            if let Err(e) = socket.send_slice(&buf, dest) {
                tracing::warn!("send DHCP reply failed: {e:?}");
            }
        }
    }

    fn service_dns(&mut self) {
        let socket = self.sockets.get_mut::<udp::Socket>(self.dns_handle);

        let mut queries: Vec<(Vec<u8>, IpEndpoint)> = Vec::new();
        while let Ok((data, meta)) = socket.recv() {
            queries.push((data.to_vec(), meta.endpoint));
        }

        for (query, endpoint) in queries {
            match self.zones.answer(&query) {
                ZoneAnswer::Authoritative(bytes) => self.send_dns(&bytes, endpoint),
                ZoneAnswer::NotOurs { qname, qtype } => {
                    self.dns_token += 1;
                    self.dns_pending.insert(self.dns_token, endpoint);
                    let _ = self.dns_jobs.send((self.dns_token, qname, qtype, query));
                }
                ZoneAnswer::Garbage => {}
            }
        }

        while let Ok((token, bytes)) = self.dns_done.try_recv() {
            if let Some(endpoint) = self.dns_pending.remove(&token) {
                if !bytes.is_empty() {
                    self.send_dns(&bytes, endpoint);
                }
            }
        }
    }

    fn send_dns(&mut self, bytes: &[u8], endpoint: IpEndpoint) {
        let socket = self.sockets.get_mut::<udp::Socket>(self.dns_handle);
        if let Err(e) = socket.send_slice(bytes, endpoint) {
            tracing::warn!("send DNS reply failed: {e:?}");
        }
    }

    fn service_listeners(&mut self) {
        let gateway = self.config.gateway_ip;

        for li in 0..self.listeners.len() {
            // Replenish the listen backlog.
            while self.listeners[li].handles.len() < LISTEN_BACKLOG {
                let mut socket = tcp::Socket::new(
                    tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
                    tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER]),
                );
                let port = self.listeners[li].port;
                if socket
                    .listen(IpEndpoint::new(IpAddress::Ipv4(gateway.into()), port))
                    .is_err()
                {
                    break;
                }
                let handle = self.sockets.add(socket);
                self.listeners[li].handles.push(handle);
            }

            // Promote established connections to bridges.
            let mut hi = 0;
            while hi < self.listeners[li].handles.len() {
                let handle = self.listeners[li].handles[hi];
                let state = self.sockets.get::<tcp::Socket>(handle).state();

                match state {
                    tcp::State::Established => {
                        self.listeners[li].handles.remove(hi);
                        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
                        if self.listeners[li].conns.try_send(client).is_ok() {
                            self.bridges.push(Bridge {
                                handle,
                                io: server,
                                closing: false,
                            });
                        } else {
                            self.sockets.get_mut::<tcp::Socket>(handle).abort();
                            self.sockets.remove(handle);
                        }
                    }
                    tcp::State::Closed => {
                        // A listener that fell back to closed is dead.
                        self.listeners[li].handles.remove(hi);
                        self.sockets.remove(handle);
                    }
                    _ => hi += 1,
                }
            }
        }

        // Forget listeners whose consumer went away.
        self.listeners.retain(|l| !l.conns.is_closed());
    }

    fn service_bridges(&mut self, cx: &mut Context<'_>) {
        let mut bi = 0;
        while bi < self.bridges.len() {
            let keep = {
                let bridge = &mut self.bridges[bi];
                let socket = self.sockets.get_mut::<tcp::Socket>(bridge.handle);
                service_bridge(socket, bridge, cx)
            };

            if keep {
                bi += 1;
            } else {
                let handle = self.bridges[bi].handle;
                self.sockets.remove(handle);
                self.bridges.remove(bi);
            }
        }
    }
}

/// Moves bytes between one TCP socket and its duplex stream. Returns false
/// once the flow is finished and the bridge should be dropped.
fn service_bridge(socket: &mut tcp::Socket, bridge: &mut Bridge, cx: &mut Context<'_>) -> bool {
    // Guest to host.
    let mut stalled = false;
    while socket.can_recv() && !stalled {
        let mut broken = false;
        let result = socket.recv(|data| {
            match Pin::new(&mut bridge.io).poll_write(cx, data) {
                Poll::Ready(Ok(n)) => (n, n),
                Poll::Ready(Err(_)) => {
                    broken = true;
                    (0, 0)
                }
                Poll::Pending => (0, 0),
            }
        });

        match result {
            Ok(0) => stalled = true,
            Ok(_) => {}
            Err(_) => break,
        }
        if broken {
            socket.abort();
            return false;
        }
    }

    // Host to guest.
    loop {
        let free = socket.send_capacity() - socket.send_queue();
        if !socket.can_send() || free == 0 {
            break;
        }

        let mut buf = vec![0u8; free.min(4096)];
        let mut read_buf = ReadBuf::new(&mut buf);
        match Pin::new(&mut bridge.io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    // Consumer closed its write half; finish the flow.
                    if !bridge.closing {
                        socket.close();
                        bridge.closing = true;
                    }
                    break;
                }
                if socket.send_slice(filled).is_err() {
                    socket.abort();
                    return false;
                }
            }
            Poll::Ready(Err(_)) => {
                socket.abort();
                return false;
            }
            Poll::Pending => break,
        }
    }

    if !socket.is_open() {
        // Remote side is done; dropping the bridge drops our duplex half,
        // which surfaces EOF to the consumer once it drains.
        return socket.can_recv();
    }

    true
}

fn spawn_dns_resolver(
    mut jobs: mpsc::UnboundedReceiver<DnsJob>,
    done: mpsc::UnboundedSender<(u64, Vec<u8>)>,
) {
    tokio::spawn(async move {
        while let Some((token, qname, qtype, query)) = jobs.recv().await {
            let done = done.clone();
            tokio::spawn(async move {
                let bytes = dns::resolve_upstream(&qname, qtype, &query).await;
                let _ = done.send((token, bytes));
            });
        }
    });
}

fn smol_now(start: std::time::Instant) -> SmolInstant {
    SmolInstant::from_millis(start.elapsed().as_millis() as i64)
}
