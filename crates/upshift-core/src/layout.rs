use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::archive::ArchiveType;

/// Path authority for the on-disk update area. The install directory is the
/// tree being updated; everything the engine writes lives under the updates
/// directory so a failed attempt never litters the install tree itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLayout {
    install_dir: PathBuf,
    updates_dir: PathBuf,
}

impl UpdateLayout {
    pub fn new(install_dir: impl Into<PathBuf>, updates_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            updates_dir: updates_dir.into(),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn updates_dir(&self) -> &Path {
        &self.updates_dir
    }

    /// Working directory for the current patch attempt.
    pub fn patch_dir(&self) -> PathBuf {
        self.updates_dir.join("0")
    }

    pub fn archive_path(&self, archive_type: ArchiveType) -> PathBuf {
        self.patch_dir()
            .join(format!("patch.{}", archive_type.file_extension()))
    }

    pub fn archive_part_path(&self, archive_type: ArchiveType) -> PathBuf {
        self.patch_dir()
            .join(format!("patch.{}.part", archive_type.file_extension()))
    }

    pub fn status_path(&self) -> PathBuf {
        self.updates_dir.join("update.status")
    }

    pub fn install_log_path(&self) -> PathBuf {
        self.patch_dir().join("update.log")
    }

    pub fn last_log_path(&self) -> PathBuf {
        self.updates_dir.join("last-update.log")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.patch_dir().join("backup")
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.patch_dir().join("extracted")
    }

    pub fn cancel_path(&self) -> PathBuf {
        self.patch_dir().join("cancel")
    }

    pub fn stage_dir(&self) -> PathBuf {
        self.updates_dir.join("staged")
    }

    pub fn history_path(&self) -> PathBuf {
        self.updates_dir.join("updates.toml")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.updates_dir.clone(), self.patch_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}
