//! The virtio device graph, built as data before it touches the
//! framework.

use std::path::PathBuf;

/// One virtio device in the graph.
///
/// Block devices are attached in list order and surface in the guest as
/// vda, vdb, vdc, ...; the kernel assumes vda is the root filesystem, so
/// the order is load-bearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Block { path: PathBuf, read_only: bool },
    Vsock { port: u32, socket_path: PathBuf },
    Fs { tag: String, share_dir: PathBuf },
    SerialStdio,
    SerialFile { path: PathBuf },
    Rng,
}

/// Everything needed to instantiate the VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub cmdline: String,
    pub devices: Vec<Device>,
}

impl VmSpec {
    /// Block device paths in attach order.
    pub fn block_devices(&self) -> Vec<&PathBuf> {
        self.devices
            .iter()
            .filter_map(|d| match d {
                Device::Block { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Vsock port to host socket pairs, in declaration order.
    pub fn vsock_devices(&self) -> Vec<(u32, PathBuf)> {
        self.devices
            .iter()
            .filter_map(|d| match d {
                Device::Vsock { port, socket_path } => Some((*port, socket_path.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn has_vsock(&self) -> bool {
        self.devices
            .iter()
            .any(|d| matches!(d, Device::Vsock { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(devices: Vec<Device>) -> VmSpec {
        VmSpec {
            cpus: 1,
            memory_bytes: 1 << 30,
            kernel: PathBuf::from("/t/bzImage"),
            initrd: PathBuf::from("/t/initrd"),
            cmdline: "console=hvc0".to_string(),
            devices,
        }
    }

    #[test]
    fn block_order_is_preserved() {
        let s = spec(vec![
            Device::Rng,
            Device::Block {
                path: PathBuf::from("/t/rootfs.img"),
                read_only: false,
            },
            Device::Vsock {
                port: 1024,
                socket_path: PathBuf::from("/s/net.sock"),
            },
            Device::Block {
                path: PathBuf::from("/t/tmp.img"),
                read_only: false,
            },
            Device::Block {
                path: PathBuf::from("/t/data.img"),
                read_only: false,
            },
        ]);

        let blocks = s.block_devices();
        assert_eq!(
            blocks,
            vec![
                &PathBuf::from("/t/rootfs.img"), // vda
                &PathBuf::from("/t/tmp.img"),    // vdb
                &PathBuf::from("/t/data.img"),   // vdc
            ]
        );
    }

    #[test]
    fn vsock_devices_keep_their_ports() {
        let s = spec(vec![
            Device::Vsock {
                port: 1024,
                socket_path: PathBuf::from("/s/net.sock"),
            },
            Device::Vsock {
                port: 1025,
                socket_path: PathBuf::from("/s/initrd.sock"),
            },
            Device::Vsock {
                port: 1026,
                socket_path: PathBuf::from("/s/ready.sock"),
            },
        ]);

        let ports: Vec<u32> = s.vsock_devices().iter().map(|(p, _)| *p).collect();
        assert_eq!(ports, vec![1024, 1025, 1026]);
        assert!(s.has_vsock());
    }

    #[test]
    fn no_vsock_is_detected() {
        let s = spec(vec![Device::Rng]);
        assert!(!s.has_vsock());
        assert!(s.vsock_devices().is_empty());
    }
}
