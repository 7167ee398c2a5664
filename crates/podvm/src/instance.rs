//! Single-instance gate.
//!
//! One live supervisor per (binary, instance name). A stale or abandoned
//! lock is reclaimed; a live owner running the same binary is asked to
//! terminate, then killed, before we take its place.

use crate::error::Result;
use podvm_core::paths::lowercase_path;
use podvm_core::{PidLock, process};
use std::path::{Path, PathBuf};
use std::time::Duration;

const OWNER_EXIT_WAIT: u32 = 10;

/// Acquires the instance lock, evicting a matching previous owner first.
pub async fn make_single_instance(lock_file: &Path, executable: &Path) -> Result<PidLock> {
    podvm_core::paths::ensure_lock_dir()?;
    let mut lock = PidLock::new(lock_file);

    if !lock_file.exists() {
        lock.try_lock()?;
        return Ok(lock);
    }

    tracing::info!("pid lock file exists, try kill previous process");

    let owner = match lock.owner() {
        Ok(owner) => owner,
        Err(e) => {
            tracing::warn!("get pid lock owner error: {e}, try lock");
            lock.try_lock()?;
            return Ok(lock);
        }
    };

    tracing::info!("pid lock owner: {owner}");

    if !process::alive(owner) {
        tracing::info!("pid lock owner {owner} not exists, try lock");
        lock.try_lock()?;
        return Ok(lock);
    }

    match executable_of(owner) {
        Some(owner_exe) if owner_exe == lowercase_path(executable) => {
            tracing::info!("pid lock owner {owner} exe matches, terminating it");
            evict(owner).await;
        }
        Some(owner_exe) => {
            tracing::info!(
                "pid lock owner {owner} exe '{}' not match '{}', try lock",
                owner_exe.display(),
                executable.display()
            );
        }
        None => {
            // Resolution failure means we cannot prove it is ours;
            // treat as not matching and reclaim.
            tracing::warn!("resolve pid lock owner {owner} executable failed, try lock");
        }
    }

    lock.try_lock()?;
    Ok(lock)
}

/// SIGTERM, a bounded wait, then SIGKILL.
async fn evict(owner: i32) {
    if let Err(e) = process::terminate(owner) {
        tracing::warn!("kill previous process error: {e}, try force kill");
        if let Err(e) = process::force_kill(owner) {
            tracing::warn!("force kill previous process error: {e}, try lock");
            return;
        }
    }

    tracing::info!("sent SIGTERM to {owner}, wait {OWNER_EXIT_WAIT}s for it to exit");

    for _ in 0..OWNER_EXIT_WAIT {
        if !process::alive(owner) {
            tracing::info!("previous process exited");
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    tracing::warn!("process {owner} did not exit, force killing");
    if let Err(e) = process::force_kill(owner) {
        tracing::warn!("force kill previous process error: {e}, try lock");
    }
}

/// Symlink-resolved, lowercased executable path of a process, or None
/// when it cannot be determined.
fn executable_of(pid: i32) -> Option<PathBuf> {
    let raw = raw_executable_of(pid)?;
    let resolved = std::fs::canonicalize(&raw).ok()?;
    Some(lowercase_path(&resolved))
}

#[cfg(target_os = "macos")]
fn raw_executable_of(pid: i32) -> Option<PathBuf> {
    let mut buf = vec![0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    // SAFETY: buf is valid for its length; proc_pidpath writes at most
    // that many bytes and returns the length used.
    let len = unsafe {
        libc::proc_pidpath(
            pid,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len() as u32,
        )
    };
    if len <= 0 {
        return None;
    }
    buf.truncate(len as usize);
    Some(PathBuf::from(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(not(target_os = "macos"))]
fn raw_executable_of(pid: i32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{pid}/exe")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_lock_is_acquired() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_file = tmp.path().join("fresh.pid");

        let lock = make_single_instance(&lock_file, Path::new("/bin/podvm"))
            .await
            .unwrap();
        assert!(lock.is_held());
        assert!(lock_file.exists());
    }

    #[tokio::test]
    async fn stale_lock_with_dead_owner_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_file = tmp.path().join("stale.pid");
        std::fs::write(&lock_file, format!("{}", i32::MAX - 1)).unwrap();

        let lock = make_single_instance(&lock_file, Path::new("/bin/podvm"))
            .await
            .unwrap();
        assert!(lock.is_held());
    }

    #[tokio::test]
    async fn unparseable_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_file = tmp.path().join("garbage.pid");
        std::fs::write(&lock_file, "not a pid").unwrap();

        let lock = make_single_instance(&lock_file, Path::new("/bin/podvm"))
            .await
            .unwrap();
        assert!(lock.is_held());
    }

    #[tokio::test]
    async fn live_owner_with_different_binary_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let lock_file = tmp.path().join("other.pid");
        // Our own pid is alive, but our executable is not "/bin/else".
        std::fs::write(&lock_file, format!("{}", std::process::id())).unwrap();

        let lock = make_single_instance(&lock_file, Path::new("/bin/else"))
            .await
            .unwrap();
        assert!(lock.is_held());
        assert!(process::alive(std::process::id() as i32));
    }

    #[test]
    fn own_executable_resolves() {
        let exe = executable_of(std::process::id() as i32);
        assert!(exe.is_some());
    }
}
