use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use upshift_core::HashAlgorithm;
use upshift_verify::hash_file_hex;

use crate::log::{
    append_entry, has_commit, read_entries, InstallLog, InstallLogEntry, STEP_BACKUP, STEP_COMMIT,
    STEP_PREPARE, STEP_REMOVE, STEP_ROLLBACK, STEP_WRITE,
};
use crate::manifest::{FileAction, PatchManifest, PAYLOAD_DIR_NAME};

const IN_USE_RETRIES: u32 = 5;
const IN_USE_RETRY_DELAY: Duration = Duration::from_millis(100);
const STAGED_WRITE_SUFFIX: &str = ".upshift-new";

/// Why an apply attempt failed. This maps 1:1 onto the worker's closed exit
/// code set, so the parent process can branch without parsing any text.
#[derive(Debug)]
pub enum ApplyError {
    CorruptArchive(String),
    WrongSize(String),
    Permission(String),
    InUse(String),
    Cancelled,
    Generic(anyhow::Error),
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CorruptArchive(detail) => write!(f, "corrupt patch archive: {detail}"),
            Self::WrongSize(detail) => write!(f, "wrong source file size: {detail}"),
            Self::Permission(detail) => write!(f, "permission denied: {detail}"),
            Self::InUse(detail) => write!(f, "file in use: {detail}"),
            Self::Cancelled => write!(f, "apply cancelled"),
            Self::Generic(err) => write!(f, "{err:#}"),
        }
    }
}

/// Applies an extracted patch archive to `target_dir`. Every mutation is
/// intent-logged first and originals are moved into the backup tree, so the
/// previous good state stays reconstructable until the commit record lands.
/// A failed attempt is rolled back before this returns.
pub fn apply_extracted(
    extracted: &Path,
    target_dir: &Path,
    log_path: &Path,
    backup_dir: &Path,
    cancel_path: &Path,
) -> Result<(), ApplyError> {
    let manifest =
        PatchManifest::load(extracted).map_err(|err| ApplyError::CorruptArchive(format!("{err:#}")))?;
    let payload_root = extracted.join(PAYLOAD_DIR_NAME);

    preflight(&manifest, &payload_root, target_dir)?;

    let mut log = InstallLog::create(log_path).map_err(ApplyError::Generic)?;
    log.append(STEP_PREPARE, None).map_err(ApplyError::Generic)?;

    match execute(
        &manifest,
        &payload_root,
        target_dir,
        backup_dir,
        cancel_path,
        &mut log,
    ) {
        Ok(()) => {
            log.append(STEP_COMMIT, None).map_err(ApplyError::Generic)?;
            let _ = fs::remove_dir_all(backup_dir);
            Ok(())
        }
        Err(err) => {
            if let Err(rollback_err) = rollback_from_log(log_path, target_dir, backup_dir) {
                return Err(ApplyError::Generic(anyhow!(
                    "{err} (rollback also failed: {rollback_err:#})"
                )));
            }
            Err(err)
        }
    }
}

/// Checks every pre-condition before the first mutation: payload files must
/// be present, and each replace pre-image must match the install tree.
fn preflight(
    manifest: &PatchManifest,
    payload_root: &Path,
    target_dir: &Path,
) -> Result<(), ApplyError> {
    for action in &manifest.actions {
        if action.has_payload() {
            let payload = payload_root.join(action.path());
            if !payload.is_file() {
                return Err(ApplyError::CorruptArchive(format!(
                    "archive is missing the payload for '{}'",
                    action.path()
                )));
            }
        }

        if let FileAction::Replace {
            path,
            source_size,
            source_sha256,
        } = action
        {
            let existing = target_dir.join(path);
            let metadata = fs::metadata(&existing).map_err(|_| {
                ApplyError::CorruptArchive(format!(
                    "install tree is missing '{path}', which this patch replaces"
                ))
            })?;
            if metadata.len() != *source_size {
                return Err(ApplyError::WrongSize(format!(
                    "'{path}' is {} bytes, the patch expects {source_size}",
                    metadata.len()
                )));
            }

            let actual = hash_file_hex(&existing, HashAlgorithm::Sha256).map_err(|err| {
                ApplyError::Generic(anyhow!("failed to hash source file '{path}': {err}"))
            })?;
            if !actual.eq_ignore_ascii_case(source_sha256) {
                return Err(ApplyError::CorruptArchive(format!(
                    "'{path}' does not match the patch pre-image"
                )));
            }
        }
    }
    Ok(())
}

fn execute(
    manifest: &PatchManifest,
    payload_root: &Path,
    target_dir: &Path,
    backup_dir: &Path,
    cancel_path: &Path,
    log: &mut InstallLog,
) -> Result<(), ApplyError> {
    for action in &manifest.actions {
        if cancel_path.exists() {
            return Err(ApplyError::Cancelled);
        }

        let rel = action.path();
        let dest = target_dir.join(rel);
        match action {
            FileAction::Add { .. } | FileAction::Replace { .. } => {
                if dest.symlink_metadata().is_ok() {
                    log.append(STEP_BACKUP, Some(rel)).map_err(ApplyError::Generic)?;
                    move_to_backup(&dest, &backup_dir.join(rel))?;
                }
                log.append(STEP_WRITE, Some(rel)).map_err(ApplyError::Generic)?;
                place_payload(&payload_root.join(rel), &dest)?;
            }
            FileAction::Remove { .. } => {
                if dest.symlink_metadata().is_ok() {
                    log.append(STEP_BACKUP, Some(rel)).map_err(ApplyError::Generic)?;
                    move_to_backup(&dest, &backup_dir.join(rel))?;
                    log.append(STEP_REMOVE, Some(rel)).map_err(ApplyError::Generic)?;
                }
            }
        }
    }
    Ok(())
}

fn move_to_backup(source: &Path, backup_path: &Path) -> Result<(), ApplyError> {
    if let Some(parent) = backup_path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            ApplyError::Generic(anyhow!(
                "failed to create backup dir {}: {err}",
                parent.display()
            ))
        })?;
    }
    with_in_use_retry(|| fs::rename(source, backup_path))
        .map_err(|err| classify(err, format!("failed to back up {}", source.display())))
}

fn place_payload(payload: &Path, dest: &Path) -> Result<(), ApplyError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| classify(err, format!("failed to create {}", parent.display())))?;
    }

    // Land the bytes under a staging name first so a crash mid-copy can
    // never leave a truncated file at the final path.
    let staged = staged_write_path(dest);
    fs::copy(payload, &staged)
        .map_err(|err| classify(err, format!("failed to stage {}", dest.display())))?;
    with_in_use_retry(|| fs::rename(&staged, dest))
        .map_err(|err| classify(err, format!("failed to write {}", dest.display())))
}

fn staged_write_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(STAGED_WRITE_SUFFIX);
    dest.with_file_name(name)
}

/// Undoes a partially applied attempt using the install log: written files
/// come back out, backed-up originals go back in. Tolerates actions that
/// were intent-logged but never performed, and re-running it over an
/// already-rolled-back tree is a no-op, which is what crash recovery
/// needs: the worker may have rolled back itself before dying.
pub fn rollback_from_log(log_path: &Path, target_dir: &Path, backup_dir: &Path) -> Result<()> {
    let entries = read_entries(log_path)?;
    if has_commit(&entries) {
        return Err(anyhow!(
            "refusing to roll back a committed apply attempt: {}",
            log_path.display()
        ));
    }

    let backed_up: std::collections::HashSet<&str> = entries
        .iter()
        .filter(|entry| entry.step == STEP_BACKUP)
        .filter_map(|entry| entry.path.as_deref())
        .collect();

    for entry in entries.iter().rev() {
        let Some(rel) = entry.path.as_deref() else {
            continue;
        };
        let dest = target_dir.join(rel);
        match entry.step.as_str() {
            // A write with no backup introduced a new file; take it out.
            // Files with a backup are handled below, where the restore
            // replaces whatever sits at the destination.
            STEP_WRITE if !backed_up.contains(rel) => {
                if dest.symlink_metadata().is_ok() {
                    fs::remove_file(&dest).with_context(|| {
                        format!("failed to remove written file {}", dest.display())
                    })?;
                }
            }
            STEP_BACKUP => {
                // A missing backup means it was already restored.
                let backup = backup_dir.join(rel);
                if backup.symlink_metadata().is_ok() {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)
                            .with_context(|| format!("failed to create {}", parent.display()))?;
                    }
                    if dest.symlink_metadata().is_ok() {
                        fs::remove_file(&dest).with_context(|| {
                            format!("failed to clear {} before restore", dest.display())
                        })?;
                    }
                    fs::rename(&backup, &dest).with_context(|| {
                        format!("failed to restore backup of {}", dest.display())
                    })?;
                }
            }
            _ => {}
        }
    }

    remove_staged_leftovers(target_dir)?;

    let next_seq = entries.last().map(|entry| entry.seq + 1).unwrap_or(1);
    append_entry(
        log_path,
        &InstallLogEntry {
            seq: next_seq,
            step: STEP_ROLLBACK.to_string(),
            path: None,
        },
    )?;
    let _ = fs::remove_dir_all(backup_dir);
    Ok(())
}

/// Clears `*.upshift-new` staging files a crashed write may have left in the
/// target tree.
fn remove_staged_leftovers(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_dir() {
            remove_staged_leftovers(&path)?;
            continue;
        }
        let is_leftover = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(STAGED_WRITE_SUFFIX))
            .unwrap_or(false);
        if is_leftover {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }
    Ok(())
}

pub(crate) enum FileOpKind {
    Permission,
    InUse,
    Other,
}

pub(crate) fn file_op_kind(err: &io::Error) -> FileOpKind {
    if let Some(code) = err.raw_os_error() {
        if is_in_use_code(code) {
            return FileOpKind::InUse;
        }
    }
    if err.kind() == io::ErrorKind::PermissionDenied {
        return FileOpKind::Permission;
    }
    FileOpKind::Other
}

fn is_in_use_code(code: i32) -> bool {
    #[cfg(unix)]
    {
        // EBUSY, ETXTBSY
        code == 16 || code == 26
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
        code == 32 || code == 33
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = code;
        false
    }
}

/// Bounded wait for an in-use file to free up; anything else fails fast.
fn with_in_use_retry<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempts = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if matches!(file_op_kind(&err), FileOpKind::InUse) => {
                attempts += 1;
                if attempts > IN_USE_RETRIES {
                    return Err(err);
                }
                std::thread::sleep(IN_USE_RETRY_DELAY);
            }
            Err(err) => return Err(err),
        }
    }
}

fn classify(err: io::Error, detail: String) -> ApplyError {
    match file_op_kind(&err) {
        FileOpKind::InUse => ApplyError::InUse(format!("{detail}: {err}")),
        FileOpKind::Permission => ApplyError::Permission(format!("{detail}: {err}")),
        FileOpKind::Other => ApplyError::Generic(anyhow!("{detail}: {err}")),
    }
}
