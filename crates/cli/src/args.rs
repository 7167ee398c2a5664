//! Flag parsing and validation.

use anyhow::bail;
use clap::Parser;
use podvm_core::{InstanceConfig, Versions};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "podvm")]
#[command(about = "Supervisor for a lightweight Podman machine VM on macOS")]
#[command(version)]
pub struct Args {
    /// Name of the virtual machine
    #[arg(long, default_value = "")]
    pub name: String,

    /// Directory to store logs
    #[arg(long, default_value = "")]
    pub log_path: String,

    /// Directory for all socket files
    #[arg(long, default_value = "")]
    pub socket_path: String,

    /// Directory for the SSH key pair
    #[arg(long, default_value = "")]
    pub ssh_key_path: String,

    /// Number of CPUs
    #[arg(long, default_value_t = 0)]
    pub cpus: u32,

    /// Amount of memory in megabytes
    #[arg(long, default_value_t = 0)]
    pub memory: u64,

    /// Path to the kernel image
    #[arg(long, default_value = "")]
    pub kernel_path: String,

    /// Path to the initrd image
    #[arg(long, default_value = "")]
    pub initrd_path: String,

    /// Path to the rootfs image
    #[arg(long, default_value = "")]
    pub rootfs_path: String,

    /// Directory for disk images and copied boot artifacts
    #[arg(long, default_value = "")]
    pub target_path: String,

    /// Component versions, comma-separated k=v pairs (kernel, initrd, rootfs, data)
    #[arg(long, default_value = "")]
    pub versions: String,

    /// Send events to this unix socket
    #[arg(long, default_value = "")]
    pub event_socket_path: String,

    /// Run in CLI mode (serial console on stdio)
    #[arg(long)]
    pub cli: bool,

    /// Exit when this pid exits
    #[arg(long, default_value_t = 0)]
    pub bind_pid: i32,

    /// Pause the VM while the host sleeps
    #[arg(long)]
    pub power_save_mode: bool,

    /// Append kernel debug options
    #[arg(long)]
    pub kernel_debug: bool,

    /// Extra virtio-fs shares, comma-separated tag:host-dir pairs
    #[arg(long, default_value = "")]
    pub extend_share_dir: String,
}

impl Args {
    /// Validates the flags and builds the immutable instance config.
    pub fn into_config(self) -> anyhow::Result<InstanceConfig> {
        for (flag, value) in [
            ("name", &self.name),
            ("log-path", &self.log_path),
            ("socket-path", &self.socket_path),
            ("ssh-key-path", &self.ssh_key_path),
            ("kernel-path", &self.kernel_path),
            ("initrd-path", &self.initrd_path),
            ("rootfs-path", &self.rootfs_path),
            ("target-path", &self.target_path),
            ("versions", &self.versions),
        ] {
            if value.is_empty() {
                bail!("{flag} is required");
            }
        }
        if self.cpus == 0 {
            bail!("cpus is required");
        }
        if self.memory == 0 {
            bail!("memory is required");
        }

        let versions = Versions::parse(&self.versions)?;
        let extend_share_dirs = InstanceConfig::parse_share_dirs(&self.extend_share_dir)?;

        let abs = |p: &str| -> anyhow::Result<PathBuf> { Ok(std::path::absolute(p)?) };

        let config = InstanceConfig {
            name: self.name,
            cpus: self.cpus,
            memory_bytes: self.memory * 1024 * 1024,
            kernel_src: abs(&self.kernel_path)?,
            initrd_src: abs(&self.initrd_path)?,
            rootfs_src: abs(&self.rootfs_path)?,
            target_dir: abs(&self.target_path)?,
            socket_dir: abs(&self.socket_path)?,
            ssh_key_dir: abs(&self.ssh_key_path)?,
            log_dir: abs(&self.log_path)?,
            versions,
            event_socket: (!self.event_socket_path.is_empty())
                .then(|| PathBuf::from(self.event_socket_path)),
            cli_mode: self.cli,
            bind_pid: self.bind_pid,
            power_save: self.power_save_mode,
            kernel_debug: self.kernel_debug,
            extend_share_dirs,
        };

        config.validate()?;
        Ok(config)
    }
}
