//! Vsock connectors: guest connections on a vsock port are spliced onto
//! the matching host unix socket.
//!
//! The supervisor owns the unix listener side of each socket; the proxy
//! here dials it as a client whenever the guest connects.

use crate::error::{Result, VzError};
use crate::vm::VmHandle;
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2::{DefinedClass, MainThreadMarker, MainThreadOnly, define_class};
use objc2_foundation::{NSObject, NSObjectProtocol};
use objc2_virtualization::{
    VZVirtioSocketConnection, VZVirtioSocketDevice, VZVirtioSocketListener,
    VZVirtioSocketListenerDelegate,
};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

const SPLICE_BUFFER: usize = 4096;

pub struct VsockListenerDelegateIvars {
    connections: mpsc::UnboundedSender<OwnedFd>,
}

define_class!(
    #[unsafe(super(NSObject))]
    #[thread_kind = MainThreadOnly]
    #[ivars = VsockListenerDelegateIvars]
    pub struct VsockListenerDelegate;

    unsafe impl NSObjectProtocol for VsockListenerDelegate {}

    unsafe impl VZVirtioSocketListenerDelegate for VsockListenerDelegate {
        #[unsafe(method(listener:shouldAcceptNewConnection:fromSocketDevice:))]
        fn listener_should_accept_new_connection(
            &self,
            _listener: &VZVirtioSocketListener,
            connection: &VZVirtioSocketConnection,
            _socket_device: &VZVirtioSocketDevice,
        ) -> objc2::runtime::Bool {
            let fd = unsafe { connection.fileDescriptor() };
            if fd < 0 {
                return false.into();
            }

            // The connection object owns its descriptor; keep a duplicate.
            let dup_fd = unsafe { libc::dup(fd) };
            if dup_fd < 0 {
                return false.into();
            }

            // SAFETY: dup_fd is a fresh descriptor we own.
            let owned = unsafe { OwnedFd::from_raw_fd(dup_fd) };
            if self.ivars().connections.send(owned).is_err() {
                return false.into();
            }

            true.into()
        }
    }
);

impl VsockListenerDelegate {
    fn new(mtm: MainThreadMarker, connections: mpsc::UnboundedSender<OwnedFd>) -> Retained<Self> {
        let this = Self::alloc(mtm);
        let this = this.set_ivars(VsockListenerDelegateIvars { connections });
        // SAFETY: Calling init on a freshly allocated NSObject subclass
        unsafe { objc2::msg_send![super(this), init] }
    }
}

/// Live vsock connectors. Dropping (or releasing) removes the listeners
/// and stops the splice tasks.
pub struct VsockProxies {
    ports: Vec<u32>,
    vm: VmHandle,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Registers one listener per `(port, unix socket)` pair on the VM's
/// virtio-socket device.
pub fn connect_vsocks(vm: &VmHandle, devices: &[(u32, PathBuf)]) -> Result<VsockProxies> {
    let mut tasks = Vec::new();
    let mut ports = Vec::new();

    for (port, socket_path) in devices {
        let port = *port;
        tracing::info!("exposing vsock port {port} on {}", socket_path.display());

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let registered = vm.on_vm(move |vm| {
            let mtm = MainThreadMarker::new().expect("on_vm runs on the main thread");

            // SAFETY: main thread; the device array is owned by the VM.
            unsafe {
                let devices = vm.socketDevices();
                if devices.count() == 0 {
                    return false;
                }
                let device = devices.objectAtIndex(0);

                let delegate = VsockListenerDelegate::new(mtm, conn_tx);
                let listener = VZVirtioSocketListener::new();
                listener.setDelegate(Some(ProtocolObject::from_ref(&*delegate)));
                device.setSocketListener_forPort(&listener, port);

                // The device retains the listener; keep the delegate alive
                // by leaking a reference owned by the listener's lifetime.
                let _ = Retained::into_raw(delegate);
                let _ = Retained::into_raw(listener);
                true
            }
        });

        if !registered {
            return Err(VzError::Hypervisor(
                "VM has no virtio-vsock device".to_string(),
            ));
        }

        ports.push(port);
        tasks.push(tokio::spawn(splice_loop(port, socket_path.clone(), conn_rx)));
    }

    Ok(VsockProxies {
        ports,
        vm: vm.clone(),
        tasks,
    })
}

impl VsockProxies {
    /// Removes the port listeners and stops all splice tasks.
    pub fn release(self) {
        let ports = self.ports.clone();
        self.vm.on_vm(move |vm| {
            // SAFETY: main thread; removing listeners we registered.
            unsafe {
                let devices = vm.socketDevices();
                if devices.count() == 0 {
                    return;
                }
                let device = devices.objectAtIndex(0);
                for port in ports {
                    device.removeSocketListenerForPort(port);
                }
            }
        });

        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Accepts guest connections for one port and splices each onto the
/// host unix socket.
async fn splice_loop(port: u32, socket_path: PathBuf, mut conns: mpsc::UnboundedReceiver<OwnedFd>) {
    while let Some(guest_fd) = conns.recv().await {
        let socket_path = socket_path.clone();
        tokio::spawn(async move {
            let host = match UnixStream::connect(&socket_path).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(
                        "vsock port {port}: dial {} failed: {e}",
                        socket_path.display()
                    );
                    return;
                }
            };

            if let Err(e) = splice(host, guest_fd).await {
                tracing::debug!("vsock port {port}: splice ended: {e}");
            }
        });
    }
}

/// Copies bytes both ways between the unix stream and the raw vsock fd
/// until either side closes.
async fn splice(host: UnixStream, guest_fd: OwnedFd) -> std::io::Result<()> {
    set_nonblocking(guest_fd.as_raw_fd());
    let guest = tokio::io::unix::AsyncFd::new(guest_fd)?;
    let (mut host_read, mut host_write) = tokio::io::split(host);

    let host_to_guest = async {
        let mut buf = [0u8; SPLICE_BUFFER];
        loop {
            let n = match host_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };

            let mut written = 0;
            while written < n {
                let mut ready = match guest.writable().await {
                    Ok(ready) => ready,
                    Err(_) => return,
                };
                match ready.try_io(|fd| fd_write(fd.as_raw_fd(), &buf[written..n])) {
                    Ok(Ok(w)) => written += w,
                    Ok(Err(_)) => return,
                    Err(_would_block) => continue,
                }
            }
        }
    };

    let guest_to_host = async {
        let mut buf = [0u8; SPLICE_BUFFER];
        loop {
            let mut ready = match guest.readable().await {
                Ok(ready) => ready,
                Err(_) => return,
            };
            let n = match ready.try_io(|fd| fd_read(fd.as_raw_fd(), &mut buf)) {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(n)) => n,
                Err(_would_block) => continue,
            };

            if host_write.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        _ = host_to_guest => {}
        _ = guest_to_host => {}
    }

    Ok(())
}

fn set_nonblocking(fd: RawFd) {
    // SAFETY: fcntl on a valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn fd_write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize> {
    // SAFETY: buf is valid for len bytes; fd is a valid descriptor.
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn fd_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    // SAFETY: buf is valid for len bytes; fd is a valid descriptor.
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}
