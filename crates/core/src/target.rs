//! Artifact materializer: reconciles the target directory against the
//! requested component versions.

use crate::config::{InstanceConfig, Versions};
use crate::error::{Error, Result};
use crate::fsutil;
use crate::paths::DerivedPaths;
use crate::versions::Manifest;
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;

const DATA_DISK_SIZE: u64 = 8 * 1024 * 1024 * 1024 * 1024; // 8 TiB
const TMP_DISK_SIZE: u64 = 1024 * 1024 * 1024 * 1024; // 1 TiB

enum Job {
    Copy { src: PathBuf, dst: PathBuf },
    SparseData { dst: PathBuf },
}

/// Brings the target directory in line with the requested versions.
///
/// For each component whose destination is missing or whose manifest entry
/// differs from the request, a task is scheduled: the data disk is
/// recreated as an 8 TiB sparse file, everything else is copied from its
/// source. Copies run concurrently; the manifest is rewritten only when
/// some entry changed and every task succeeded. A 1 TiB sparse tmp disk is
/// created alongside if missing, outside the manifest.
pub async fn reconcile(config: &InstanceConfig, paths: &DerivedPaths) -> Result<()> {
    tokio::fs::create_dir_all(&config.target_dir).await?;

    let mut manifest = Manifest::load(&paths.versions_file)?;
    let mut jobs: Vec<Job> = Vec::new();

    let sources = [
        ("kernel", config.kernel_src.clone(), paths.kernel.clone()),
        ("initrd", config.initrd_src.clone(), paths.initrd.clone()),
        ("rootfs", config.rootfs_src.clone(), paths.rootfs.clone()),
        ("data", paths.data_disk.clone(), paths.data_disk.clone()),
    ];

    for (key, src, dst) in sources {
        let requested = config
            .versions
            .get(key)
            .unwrap_or_default()
            .to_string();

        if dst.exists() && manifest.get(key) == requested {
            continue;
        }

        manifest.set(key, &requested);
        if key == "data" {
            jobs.push(Job::SparseData { dst });
        } else {
            jobs.push(Job::Copy { src, dst });
        }
    }

    run_jobs(jobs).await?;

    manifest.save()?;

    if !paths.tmp_disk.exists() {
        fsutil::create_sparse(&paths.tmp_disk, TMP_DISK_SIZE).await?;
        fsutil::exclude_from_backups(&paths.tmp_disk);
    }

    Ok(())
}

async fn run_jobs(jobs: Vec<Job>) -> Result<()> {
    let mut set = JoinSet::new();

    for job in jobs {
        set.spawn(async move {
            match job {
                Job::Copy { src, dst } => {
                    tracing::info!("copy {} -> {}", src.display(), dst.display());
                    fsutil::copy_file(&src, &dst).await
                }
                Job::SparseData { dst } => {
                    tracing::info!("recreate data disk {}", dst.display());
                    if dst.exists() {
                        tokio::fs::remove_file(&dst).await?;
                    }
                    fsutil::create_sparse(&dst, DATA_DISK_SIZE).await?;
                    fsutil::exclude_from_backups(&dst);
                    Ok(())
                }
            }
        });
    }

    let mut first_err: Option<Error> = None;
    while let Some(joined) = set.join_next().await {
        let result = joined.map_err(|e| Error::Task(e.to_string()))?;
        if let Err(e) = result {
            if first_err.is_none() {
                first_err = Some(e);
            } else {
                tracing::error!("additional materialize error: {e}");
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// True when the manifest on disk already records exactly these versions.
pub fn manifest_matches(manifest_path: &Path, versions: &Versions) -> bool {
    Manifest::load(manifest_path)
        .map(|m| m.matches(versions))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config(tmp: &Path, versions: &str) -> (InstanceConfig, DerivedPaths) {
        let images = tmp.join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("bzImage"), b"kernel-v1").unwrap();
        std::fs::write(images.join("initrd.gz"), b"initrd-v1").unwrap();
        std::fs::write(images.join("rootfs.erofs"), b"rootfs-v1").unwrap();

        let config = InstanceConfig {
            name: "default".to_string(),
            cpus: 1,
            memory_bytes: 1,
            kernel_src: images.join("bzImage"),
            initrd_src: images.join("initrd.gz"),
            rootfs_src: images.join("rootfs.erofs"),
            target_dir: tmp.join("target"),
            socket_dir: tmp.join("socks"),
            ssh_key_dir: tmp.join("keys"),
            log_dir: tmp.join("logs"),
            versions: Versions::parse(versions).unwrap(),
            event_socket: None,
            cli_mode: false,
            bind_pid: 0,
            power_save: false,
            kernel_debug: false,
            extend_share_dirs: Vec::new(),
        };
        let paths = DerivedPaths::derive(&config).unwrap();
        (config, paths)
    }

    #[tokio::test]
    async fn first_reconcile_materializes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, paths) = config(tmp.path(), "kernel=1,initrd=1,rootfs=1,data=1");

        reconcile(&config, &paths).await.unwrap();

        assert_eq!(std::fs::read(&paths.kernel).unwrap(), b"kernel-v1");
        assert_eq!(std::fs::read(&paths.rootfs).unwrap(), b"rootfs-v1");
        assert_eq!(
            std::fs::metadata(&paths.data_disk).unwrap().len(),
            DATA_DISK_SIZE
        );
        assert_eq!(
            std::fs::metadata(&paths.tmp_disk).unwrap().len(),
            TMP_DISK_SIZE
        );
        assert!(manifest_matches(&paths.versions_file, &config.versions));
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, paths) = config(tmp.path(), "kernel=1,initrd=1,rootfs=1,data=1");

        reconcile(&config, &paths).await.unwrap();
        let manifest_before = std::fs::metadata(&paths.versions_file).unwrap().modified().unwrap();

        // Overwrite a copied artifact; an idempotent second run must not
        // touch it because neither existence nor version changed.
        std::fs::write(&paths.kernel, b"locally-modified").unwrap();
        reconcile(&config, &paths).await.unwrap();

        assert_eq!(std::fs::read(&paths.kernel).unwrap(), b"locally-modified");
        let manifest_after = std::fs::metadata(&paths.versions_file).unwrap().modified().unwrap();
        assert_eq!(manifest_before, manifest_after);
    }

    #[tokio::test]
    async fn version_bump_recopies_only_that_component() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, paths) = config(tmp.path(), "kernel=1,initrd=1,rootfs=1,data=1");
        reconcile(&config, &paths).await.unwrap();

        // Mark data disk so we can detect recreation.
        std::fs::write(&paths.data_disk, b"leases live here").unwrap();
        std::fs::write(&config.kernel_src, b"kernel-v2").unwrap();

        let (config2, paths2) = {
            let mut c = config.clone();
            c.versions = Versions::parse("kernel=2,initrd=1,rootfs=1,data=1").unwrap();
            let p = DerivedPaths::derive(&c).unwrap();
            (c, p)
        };
        reconcile(&config2, &paths2).await.unwrap();

        assert_eq!(std::fs::read(&paths2.kernel).unwrap(), b"kernel-v2");
        // data version unchanged: the marker file must survive.
        assert_eq!(
            std::fs::read(&paths2.data_disk).unwrap(),
            b"leases live here"
        );
        assert!(manifest_matches(&paths2.versions_file, &config2.versions));
    }

    #[tokio::test]
    async fn missing_destination_triggers_recopy_even_with_matching_version() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, paths) = config(tmp.path(), "kernel=1,initrd=1,rootfs=1,data=1");
        reconcile(&config, &paths).await.unwrap();

        std::fs::remove_file(&paths.initrd).unwrap();
        reconcile(&config, &paths).await.unwrap();

        assert_eq!(std::fs::read(&paths.initrd).unwrap(), b"initrd-v1");
    }

    #[tokio::test]
    async fn missing_source_fails_reconcile() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut config, _) = config(tmp.path(), "kernel=1,initrd=1,rootfs=1,data=1");
        config.kernel_src = PathBuf::from("/no/such/bzImage");
        let paths = DerivedPaths::derive(&config).unwrap();

        assert!(reconcile(&config, &paths).await.is_err());
    }
}
