//! Canonical on-disk layout derived from the instance configuration.

use crate::config::InstanceConfig;
use crate::error::{Error, Result};
use md5::{Digest, Md5};
use std::path::{Path, PathBuf};

/// Directory holding pid lock files. A directory (not a file) so the name
/// cannot be squatted by an unrelated file in /tmp.
const LOCK_DIR: &str = "/tmp/podvm.lock.d";

/// Every absolute path the supervisor touches, derived once at startup.
#[derive(Debug, Clone)]
pub struct DerivedPaths {
    /// Symlink-resolved, lowercased path of the running executable.
    pub executable: PathBuf,
    pub lock_file: PathBuf,

    pub forward_socket: PathBuf,
    pub network_socket: PathBuf,
    pub initrd_vsock_socket: PathBuf,
    pub ready_socket: PathBuf,
    pub restful_socket: PathBuf,
    pub sync_time_socket: PathBuf,
    pub ssh_auth_socket: PathBuf,
    /// `unix://` form of the network socket, handed to the network stack.
    pub endpoint: String,

    pub versions_file: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub rootfs: PathBuf,
    pub data_disk: PathBuf,
    pub tmp_disk: PathBuf,

    pub ssh_private_key: PathBuf,
    pub ssh_public_key: PathBuf,
}

impl DerivedPaths {
    pub fn derive(config: &InstanceConfig) -> Result<Self> {
        let executable = resolved_executable()?;
        let lock_file = lock_file_for(&executable, &config.name);

        let sock = |suffix: &str| config.socket_dir.join(format!("{}-{suffix}", config.name));
        let network_socket = sock("network.sock");
        let endpoint = format!("unix://{}", network_socket.display());

        let base = |p: &Path| {
            p.file_name()
                .map(PathBuf::from)
                .ok_or_else(|| Error::InvalidConfig(format!("{} has no file name", p.display())))
        };

        Ok(Self {
            executable,
            lock_file,
            forward_socket: sock("podman.sock"),
            network_socket,
            initrd_vsock_socket: sock("initrd-vsock.sock"),
            ready_socket: sock("ready.sock"),
            restful_socket: sock("restful.sock"),
            sync_time_socket: sock("sync-time.sock"),
            ssh_auth_socket: sock("ssh-auth.sock"),
            endpoint,
            versions_file: config.target_dir.join("versions.json"),
            kernel: config.target_dir.join(base(&config.kernel_src)?),
            initrd: config.target_dir.join(base(&config.initrd_src)?),
            rootfs: config.target_dir.join(base(&config.rootfs_src)?),
            data_disk: config.target_dir.join("data.img"),
            tmp_disk: config.target_dir.join("tmp.img"),
            ssh_private_key: config.ssh_key_dir.join(&config.name),
            ssh_public_key: config.ssh_key_dir.join(format!("{}.pub", config.name)),
        })
    }

    /// Removes and recreates the socket directory so no stale socket from a
    /// previous run can be dialed.
    pub fn reset_socket_dir(config: &InstanceConfig) -> Result<()> {
        if config.socket_dir.exists() {
            std::fs::remove_dir_all(&config.socket_dir)?;
        }
        std::fs::create_dir_all(&config.socket_dir)?;
        Ok(())
    }
}

/// Lock file name is stable across restarts of the same binary + instance
/// name: `<md5(executable)>-<name>.pid` under the lock directory.
pub fn lock_file_for(executable: &Path, name: &str) -> PathBuf {
    let digest = Md5::digest(executable.as_os_str().as_encoded_bytes());
    PathBuf::from(LOCK_DIR).join(format!("{}-{name}.pid", hex::encode(digest)))
}

/// Creates the lock directory if needed.
pub fn ensure_lock_dir() -> Result<()> {
    std::fs::create_dir_all(LOCK_DIR)?;
    Ok(())
}

fn resolved_executable() -> Result<PathBuf> {
    let exe = std::env::current_exe().map_err(Error::ExecutablePath)?;
    let real = std::fs::canonicalize(&exe).map_err(Error::ExecutablePath)?;
    Ok(lowercase_path(&real))
}

/// Lowercases a path for comparison on the case-insensitive default
/// filesystem.
pub fn lowercase_path(p: &Path) -> PathBuf {
    PathBuf::from(p.to_string_lossy().to_lowercase())
}
