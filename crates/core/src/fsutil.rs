//! File plumbing: durable copies and sparse disk images.

use crate::error::{Error, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Copies a regular file byte-for-byte and fsyncs the destination.
pub async fn copy_file(src: &Path, dst: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(src).await?;
    if !meta.is_file() {
        return Err(Error::NotRegularFile(src.to_path_buf()));
    }

    let mut source = tokio::fs::File::open(src).await?;
    let mut dest = tokio::fs::File::create(dst).await?;
    tokio::io::copy(&mut source, &mut dest).await?;
    dest.flush().await?;
    dest.sync_all().await?;
    Ok(())
}

/// Creates (or truncates) a sparse file of exactly `size` bytes.
pub async fn create_sparse(path: &Path, size: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(Error::SparseFile)?;

    file.set_len(size).await.map_err(Error::SparseFile)?;
    file.sync_all().await.map_err(Error::SparseFile)?;
    Ok(())
}

/// Marks a file as excluded from Time Machine backups. Best effort; the
/// disks work fine without the attribute.
pub fn exclude_from_backups(path: &Path) {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = xattr::set(
            &path,
            "com.apple.metadata:com_apple_backup_excludeItem",
            b"com.apple.backupd",
        ) {
            tracing::warn!("exclude {} from backups failed: {e}", path.display());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_file_preserves_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bin");
        let dst = tmp.path().join("dst.bin");
        tokio::fs::write(&src, b"kernel image bytes").await.unwrap();

        copy_file(&src, &dst).await.unwrap();

        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"kernel image bytes");
    }

    #[tokio::test]
    async fn copy_file_rejects_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let err = copy_file(tmp.path(), &tmp.path().join("out"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[tokio::test]
    async fn sparse_file_has_logical_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");

        create_sparse(&path, 1 << 30).await.unwrap();

        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 1 << 30);
    }

    #[tokio::test]
    async fn sparse_file_truncates_existing_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        tokio::fs::write(&path, vec![0xffu8; 4096]).await.unwrap();

        create_sparse(&path, 1024).await.unwrap();

        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data.len(), 1024);
        assert!(data.iter().all(|&b| b == 0));
    }
}
