//! Virtio-fs share set and its guest fstab rendering.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub tag: String,
    pub share_dir: PathBuf,
}

/// Ordered share set: the fixed defaults plus user extensions.
#[derive(Debug, Clone)]
pub struct Mounts {
    list: Vec<Mount>,
}

impl Mounts {
    /// The host directories every instance shares into the guest.
    pub fn defaults() -> Self {
        let fixed = [
            ("podvm-share-user", "/Users"),
            ("podvm-share-var-folders", "/var/folders"),
            ("podvm-share-private", "/private"),
        ];

        Self {
            list: fixed
                .into_iter()
                .map(|(tag, dir)| Mount {
                    tag: tag.to_string(),
                    share_dir: PathBuf::from(dir),
                })
                .collect(),
        }
    }

    /// Adds a share. Tags and host paths must stay unique within the set.
    pub fn extend(&mut self, tag: &str, share_dir: &Path) -> Result<()> {
        if self.list.iter().any(|m| m.tag == tag) {
            return Err(Error::Other(format!("duplicate share tag: {tag}")));
        }
        if self.list.iter().any(|m| m.share_dir == share_dir) {
            return Err(Error::Other(format!(
                "duplicate share dir: {}",
                share_dir.display()
            )));
        }

        self.list.push(Mount {
            tag: tag.to_string(),
            share_dir: share_dir.to_path_buf(),
        });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mount> {
        self.list.iter()
    }

    /// Guest fstab lines, one per share, mount-unit safe: spaces in the
    /// guest path are escaped as `\040`.
    pub fn fstab_lines(&self) -> Vec<String> {
        self.list
            .iter()
            .map(|m| {
                let dir = m.share_dir.to_string_lossy().replace(' ', "\\040");
                format!("{} {} virtiofs defaults 0 0", m.tag, dir)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_three_host_trees() {
        let mounts = Mounts::defaults();
        let dirs: Vec<_> = mounts
            .iter()
            .map(|m| m.share_dir.to_string_lossy().into_owned())
            .collect();
        assert_eq!(dirs, ["/Users", "/var/folders", "/private"]);
    }

    #[test]
    fn extend_appends_in_order() {
        let mut mounts = Mounts::defaults();
        mounts.extend("scratch", Path::new("/tmp/scratch")).unwrap();

        let last = mounts.iter().last().unwrap();
        assert_eq!(last.tag, "scratch");
        assert_eq!(last.share_dir, PathBuf::from("/tmp/scratch"));
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let mut mounts = Mounts::defaults();
        let err = mounts
            .extend("podvm-share-user", Path::new("/elsewhere"))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate share tag"));
    }

    #[test]
    fn duplicate_dir_is_rejected() {
        let mut mounts = Mounts::defaults();
        let err = mounts.extend("other", Path::new("/Users")).unwrap_err();
        assert!(err.to_string().contains("duplicate share dir"));
    }

    #[test]
    fn fstab_lines_have_the_virtiofs_shape() {
        let mounts = Mounts::defaults();
        let lines = mounts.fstab_lines();
        assert_eq!(lines[0], "podvm-share-user /Users virtiofs defaults 0 0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn spaces_in_guest_dirs_are_escaped_for_fstab() {
        let mut mounts = Mounts::defaults();
        mounts
            .extend("spaced", Path::new("/Volumes/My Data"))
            .unwrap();

        let line = mounts.fstab_lines().pop().unwrap();
        assert_eq!(line, "spaced /Volumes/My\\040Data virtiofs defaults 0 0");
    }
}
