//! Persisted `versions.json` manifest.

use crate::config::Versions;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk record of which artifact versions the target directory holds.
///
/// Written only when some entry changed during reconciliation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub kernel: String,
    #[serde(default)]
    pub initrd: String,
    #[serde(default)]
    pub rootfs: String,
    #[serde(default)]
    pub data: String,

    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    dirty: bool,
}

impl Manifest {
    /// Loads the manifest. A missing file yields empty entries; an
    /// unparseable file is deleted and treated as absent.
    pub fn load(path: &Path) -> Result<Self> {
        let mut manifest = match std::fs::read(path) {
            Ok(data) => match serde_json::from_slice::<Manifest>(&data) {
                Ok(m) => m,
                Err(_) => {
                    std::fs::remove_file(path)?;
                    Manifest::default()
                }
            },
            Err(_) => Manifest::default(),
        };

        manifest.path = path.to_path_buf();
        Ok(manifest)
    }

    pub fn get(&self, key: &str) -> &str {
        match key {
            "kernel" => &self.kernel,
            "initrd" => &self.initrd,
            "rootfs" => &self.rootfs,
            "data" => &self.data,
            _ => "",
        }
    }

    /// Updates an entry, marking the manifest dirty when the value changed.
    pub fn set(&mut self, key: &str, value: &str) {
        let slot = match key {
            "kernel" => &mut self.kernel,
            "initrd" => &mut self.initrd,
            "rootfs" => &mut self.rootfs,
            "data" => &mut self.data,
            _ => return,
        };

        if slot != value {
            *slot = value.to_string();
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the manifest atomically if any entry changed.
    pub fn save(&self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let data = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &data)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn matches(&self, versions: &Versions) -> bool {
        self.kernel == versions.kernel
            && self.initrd == versions.initrd
            && self.rootfs == versions.rootfs
            && self.data == versions.data
    }
}
