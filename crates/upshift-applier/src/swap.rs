use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use upshift_core::UpdateLayout;

/// How the staged tree replaces the live install at finalize time. One
/// implementation per platform family, selected at startup.
pub trait SwapStrategy {
    fn swap(&self, staged: &Path, live: &Path) -> Result<()>;
}

/// Two-rename swap for filesystems where directory rename is atomic: the
/// live tree moves aside, the staged tree moves in, and the old tree is
/// restored if the second rename fails.
pub struct RenameSwap;

impl SwapStrategy for RenameSwap {
    fn swap(&self, staged: &Path, live: &Path) -> Result<()> {
        let old = retired_path(live)?;
        if old.exists() {
            fs::remove_dir_all(&old)
                .with_context(|| format!("failed to clear {}", old.display()))?;
        }

        fs::rename(live, &old)
            .with_context(|| format!("failed to move live install aside: {}", live.display()))?;
        if let Err(err) = fs::rename(staged, live) {
            let restore = fs::rename(&old, live);
            return match restore {
                Ok(()) => Err(anyhow!(
                    "failed to move staged install into place: {err} (live install restored)"
                )),
                Err(restore_err) => Err(anyhow!(
                    "failed to move staged install into place: {err} (restore also failed: {restore_err})"
                )),
            };
        }

        let _ = fs::remove_dir_all(&old);
        Ok(())
    }
}

/// Fallback for filesystems where a cross-directory rename may not work:
/// each move degrades to a recursive copy plus delete.
pub struct CopySwap;

impl SwapStrategy for CopySwap {
    fn swap(&self, staged: &Path, live: &Path) -> Result<()> {
        let old = retired_path(live)?;
        if old.exists() {
            fs::remove_dir_all(&old)
                .with_context(|| format!("failed to clear {}", old.display()))?;
        }

        move_dir_or_copy(live, &old)?;
        if let Err(err) = move_dir_or_copy(staged, live) {
            let restore = move_dir_or_copy(&old, live);
            return match restore {
                Ok(()) => Err(anyhow!(
                    "failed to move staged install into place: {err:#} (live install restored)"
                )),
                Err(restore_err) => Err(anyhow!(
                    "failed to move staged install into place: {err:#} (restore also failed: {restore_err:#})"
                )),
            };
        }

        let _ = fs::remove_dir_all(&old);
        Ok(())
    }
}

pub fn default_swap_strategy() -> Box<dyn SwapStrategy> {
    if cfg!(windows) {
        Box::new(CopySwap)
    } else {
        Box::new(RenameSwap)
    }
}

fn retired_path(live: &Path) -> Result<PathBuf> {
    let name = live
        .file_name()
        .ok_or_else(|| anyhow!("install dir has no name: {}", live.display()))?;
    let mut retired = name.to_os_string();
    retired.push(".old");
    Ok(live.with_file_name(retired))
}

/// Retries the swap with backoff; the destination may be transiently locked
/// right after the previous instance exited.
pub fn swap_with_retries(
    strategy: &dyn SwapStrategy,
    staged: &Path,
    live: &Path,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let mut remaining = attempts.max(1);
    loop {
        match strategy.swap(staged, live) {
            Ok(()) => return Ok(()),
            Err(err) => {
                remaining -= 1;
                if remaining == 0 {
                    return Err(err);
                }
                std::thread::sleep(delay);
            }
        }
    }
}

/// Builds the shadow copy a staged apply patches instead of the live tree.
/// The updates area is skipped in case it nests inside the install dir.
pub fn stage_copy(layout: &UpdateLayout) -> Result<()> {
    let staged = layout.stage_dir();
    if staged.exists() {
        fs::remove_dir_all(&staged)
            .with_context(|| format!("failed to clear stage dir: {}", staged.display()))?;
    }
    copy_tree_skipping(layout.install_dir(), &staged, layout.updates_dir())
}

pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    copy_tree_skipping(src, dst, Path::new(""))
}

fn copy_tree_skipping(src: &Path, dst: &Path, skip: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        if !skip.as_os_str().is_empty() && src_path == skip {
            continue;
        }
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_tree_skipping(&src_path, &dst_path, skip)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("failed to read symlink {}", src_path.display()))?;
            std::os::unix::fs::symlink(&target, &dst_path).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    dst_path.display(),
                    target.display()
                )
            })?;
            continue;
        }

        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

fn move_dir_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    match fs::rename(src, dst) {
        Ok(_) => Ok(()),
        Err(_) => {
            copy_tree(src, dst)?;
            fs::remove_dir_all(src)
                .with_context(|| format!("failed to clean up {}", src.display()))?;
            Ok(())
        }
    }
}
