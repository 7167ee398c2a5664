//! SSH identity for the instance: an ed25519 pair generated by the system
//! `ssh-keygen` and loaded into memory.

use crate::error::{Error, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Key pair paths plus trimmed key material.
#[derive(Debug, Clone)]
pub struct SshIdentity {
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    pub private_key: String,
    pub public_key: String,
}

impl SshIdentity {
    /// Loads the pair for `name` under `dir`, generating it first when
    /// either half is missing. Regeneration removes both halves so a
    /// mismatched pair can never survive.
    pub async fn ensure(dir: &Path, name: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let mut perms = tokio::fs::metadata(dir).await?.permissions();
        perms.set_mode(0o700);
        tokio::fs::set_permissions(dir, perms).await?;

        let private_key_path = dir.join(name);
        let public_key_path = dir.join(format!("{name}.pub"));

        if !private_key_path.exists() || !public_key_path.exists() {
            let _ = tokio::fs::remove_file(&private_key_path).await;
            let _ = tokio::fs::remove_file(&public_key_path).await;
            generate(&private_key_path).await?;
        }

        let private_key = tokio::fs::read_to_string(&private_key_path)
            .await?
            .trim()
            .to_string();
        let public_key = tokio::fs::read_to_string(&public_key_path)
            .await?
            .trim()
            .to_string();

        Ok(Self {
            private_key_path,
            public_key_path,
            private_key,
            public_key,
        })
    }
}

async fn generate(private_key_path: &Path) -> Result<()> {
    let keygen = which::which("ssh-keygen").map_err(Error::KeygenMissing)?;

    let output = tokio::process::Command::new(keygen)
        .arg("-t")
        .arg("ed25519")
        .arg("-f")
        .arg(private_key_path)
        .arg("-N")
        .arg("")
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::KeygenFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_a_pair() {
        if which::which("ssh-keygen").is_err() {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let first = SshIdentity::ensure(tmp.path(), "default").await.unwrap();
        assert!(first.public_key.starts_with("ssh-ed25519 "));
        assert!(first.private_key.contains("PRIVATE KEY"));

        // A second call must load, not regenerate.
        let second = SshIdentity::ensure(tmp.path(), "default").await.unwrap();
        assert_eq!(first.public_key, second.public_key);
    }

    #[tokio::test]
    async fn half_a_pair_is_regenerated() {
        if which::which("ssh-keygen").is_err() {
            return;
        }

        let tmp = tempfile::tempdir().unwrap();
        let first = SshIdentity::ensure(tmp.path(), "default").await.unwrap();

        tokio::fs::remove_file(&first.public_key_path).await.unwrap();
        let second = SshIdentity::ensure(tmp.path(), "default").await.unwrap();

        assert_ne!(first.public_key, second.public_key);
        assert!(second.private_key_path.exists());
        assert!(second.public_key_path.exists());
    }
}
