//! Validated instance configuration.
//!
//! Built once from command-line input before anything touches the
//! filesystem, then shared read-only with every subsystem.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Requested artifact versions, one entry per component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versions {
    pub kernel: String,
    pub initrd: String,
    pub rootfs: String,
    pub data: String,
}

impl Versions {
    /// Parses a comma-separated `key=value` list.
    ///
    /// Whitespace around items, keys, and values is ignored, as are
    /// unknown keys and malformed items. Every component must end up with
    /// a non-empty version string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut map: BTreeMap<&str, String> = BTreeMap::new();

        for item in s.split(',') {
            let Some((key, value)) = item.trim().split_once('=') else {
                continue;
            };
            let key = key.trim();
            if matches!(key, "kernel" | "initrd" | "rootfs" | "data") {
                map.insert(key, value.trim().to_string());
            }
        }

        let take = |map: &mut BTreeMap<&str, String>, key: &'static str| {
            map.remove(key)
                .filter(|v| !v.is_empty())
                .ok_or(Error::MissingVersion(key))
        };

        Ok(Self {
            kernel: take(&mut map, "kernel")?,
            initrd: take(&mut map, "initrd")?,
            rootfs: take(&mut map, "rootfs")?,
            data: take(&mut map, "data")?,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "kernel" => Some(&self.kernel),
            "initrd" => Some(&self.initrd),
            "rootfs" => Some(&self.rootfs),
            "data" => Some(&self.data),
            _ => None,
        }
    }
}

/// Instance configuration, read-only after construction.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub cpus: u32,
    pub memory_bytes: u64,
    pub kernel_src: PathBuf,
    pub initrd_src: PathBuf,
    pub rootfs_src: PathBuf,
    pub target_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub ssh_key_dir: PathBuf,
    pub log_dir: PathBuf,
    pub versions: Versions,
    pub event_socket: Option<PathBuf>,
    pub cli_mode: bool,
    pub bind_pid: i32,
    pub power_save: bool,
    pub kernel_debug: bool,
    /// Extra virtio-fs shares, `tag -> host directory`.
    pub extend_share_dirs: Vec<(String, PathBuf)>,
}

impl InstanceConfig {
    /// Parses `tag:host-dir` items out of a comma-separated list and
    /// verifies each host directory exists.
    pub fn parse_share_dirs(s: &str) -> Result<Vec<(String, PathBuf)>> {
        let mut out = Vec::new();

        if s.is_empty() {
            return Ok(out);
        }

        for item in s.split(',') {
            let Some((tag, dir)) = item.split_once(':') else {
                return Err(Error::InvalidConfig(format!(
                    "invalid extend share dir: {item}"
                )));
            };

            let dir = PathBuf::from(dir);
            let meta = std::fs::metadata(&dir).map_err(|e| {
                Error::InvalidConfig(format!(
                    "extend share dir {} not exists: {e}",
                    dir.display()
                ))
            })?;
            if !meta.is_dir() {
                return Err(Error::InvalidConfig(format!(
                    "extend share dir {} is not a directory",
                    dir.display()
                )));
            }

            out.push((tag.to_string(), dir));
        }

        Ok(out)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name is required".into()));
        }
        if self.cpus == 0 {
            return Err(Error::InvalidConfig("cpus is required".into()));
        }
        if self.memory_bytes == 0 {
            return Err(Error::InvalidConfig("memory is required".into()));
        }
        for (field, path) in [
            ("kernel-path", &self.kernel_src),
            ("initrd-path", &self.initrd_src),
            ("rootfs-path", &self.rootfs_src),
            ("target-path", &self.target_dir),
            ("socket-path", &self.socket_dir),
            ("ssh-key-path", &self.ssh_key_dir),
            ("log-path", &self.log_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(format!("{field} is required")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod versions {
        use super::*;

        #[test]
        fn parses_all_keys() {
            let v = Versions::parse("kernel=6.6,initrd=1.0,rootfs=2.1,data=1").unwrap();
            assert_eq!(v.kernel, "6.6");
            assert_eq!(v.initrd, "1.0");
            assert_eq!(v.rootfs, "2.1");
            assert_eq!(v.data, "1");
        }

        #[test]
        fn tolerates_whitespace_and_unknown_keys() {
            let v =
                Versions::parse(" kernel = 6.6 , initrd=1 , rootfs=2, data=3, extra=9 ").unwrap();
            assert_eq!(v.kernel, "6.6");
            assert_eq!(v.data, "3");
        }

        #[test]
        fn missing_key_is_an_error() {
            let err = Versions::parse("kernel=6.6,initrd=1,rootfs=2").unwrap_err();
            assert_eq!(err.to_string(), "need data in versions");
        }

        #[test]
        fn empty_value_is_an_error() {
            let err = Versions::parse("kernel=,initrd=1,rootfs=2,data=3").unwrap_err();
            assert_eq!(err.to_string(), "need kernel in versions");
        }

        #[test]
        fn malformed_items_are_skipped() {
            let v = Versions::parse("garbage,kernel=1,initrd=2,rootfs=3,data=4").unwrap();
            assert_eq!(v.kernel, "1");
        }
    }

    mod share_dirs {
        use super::*;

        #[test]
        fn empty_input_yields_no_shares() {
            assert!(InstanceConfig::parse_share_dirs("").unwrap().is_empty());
        }

        #[test]
        fn parses_existing_directory() {
            let dir = tempfile::tempdir().unwrap();
            let spec = format!("scratch:{}", dir.path().display());
            let shares = InstanceConfig::parse_share_dirs(&spec).unwrap();
            assert_eq!(shares.len(), 1);
            assert_eq!(shares[0].0, "scratch");
        }

        #[test]
        fn missing_directory_is_rejected() {
            let err = InstanceConfig::parse_share_dirs("x:/no/such/dir/podvm").unwrap_err();
            assert!(err.to_string().contains("not exists"));
        }

        #[test]
        fn missing_separator_is_rejected() {
            let err = InstanceConfig::parse_share_dirs("justatag").unwrap_err();
            assert!(err.to_string().contains("invalid extend share dir"));
        }
    }
}
