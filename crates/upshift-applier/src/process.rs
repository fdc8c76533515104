use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use upshift_core::{ArchiveType, UpdateLayout};

use crate::apply::{apply_extracted, ApplyError};
use crate::extract::extract_archive;

/// Everything the apply step needs. An elevated retry passes the identical
/// request so its install log is directly comparable to the unprivileged
/// attempt's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyRequest {
    pub archive_path: PathBuf,
    pub archive_type: ArchiveType,
    pub target_dir: PathBuf,
    pub log_path: PathBuf,
}

impl ApplyRequest {
    pub fn from_layout(
        layout: &UpdateLayout,
        archive_type: ArchiveType,
        target_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            archive_path: layout.archive_path(archive_type),
            archive_type,
            target_dir: target_dir.into(),
            log_path: layout.install_log_path(),
        }
    }

    fn patch_dir(&self) -> PathBuf {
        self.log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.patch_dir().join("extracted")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.patch_dir().join("backup")
    }

    pub fn cancel_path(&self) -> PathBuf {
        self.patch_dir().join("cancel")
    }
}

/// Result of one apply attempt as observed by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Succeeded,
    FailedPermission,
    FailedInUse,
    FailedCorrupt,
    FailedWrongSize,
    FailedGeneric(i32),
}

/// The worker's closed exit code set. Exit code 2 is left to the argument
/// parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyExit {
    Success,
    Generic,
    Permission,
    InUse,
    CorruptArchive,
    WrongSize,
    Cancelled,
}

impl ApplyExit {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Generic => 1,
            Self::Permission => 3,
            Self::InUse => 4,
            Self::CorruptArchive => 5,
            Self::WrongSize => 6,
            Self::Cancelled => 7,
        }
    }
}

pub fn outcome_for_code(code: i32) -> ApplyOutcome {
    match code {
        0 => ApplyOutcome::Succeeded,
        3 => ApplyOutcome::FailedPermission,
        4 => ApplyOutcome::FailedInUse,
        5 => ApplyOutcome::FailedCorrupt,
        6 => ApplyOutcome::FailedWrongSize,
        other => ApplyOutcome::FailedGeneric(other),
    }
}

pub trait PatchApplier {
    fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome>;
}

/// Runs the apply step out of process through the `apply-worker` entry point
/// of the given binary and interprets its exit code.
pub struct ProcessApplier {
    worker: PathBuf,
}

impl ProcessApplier {
    pub fn new(worker: impl Into<PathBuf>) -> Self {
        Self {
            worker: worker.into(),
        }
    }
}

impl PatchApplier for ProcessApplier {
    fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        let status = worker_command(&self.worker, request)
            .status()
            .with_context(|| {
                format!("failed to launch apply worker: {}", self.worker.display())
            })?;
        let code = status.code().unwrap_or(ApplyExit::Generic.code());
        Ok(outcome_for_code(code))
    }
}

/// Runs the same engine in this process. This is what the worker itself
/// executes, and what tests drive directly.
pub struct InProcessApplier;

impl PatchApplier for InProcessApplier {
    fn apply(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        Ok(outcome_for_code(run_apply(request).code()))
    }
}

pub(crate) fn worker_command(binary: &Path, request: &ApplyRequest) -> Command {
    let mut command = Command::new(binary);
    command
        .arg("apply-worker")
        .arg("--archive")
        .arg(&request.archive_path)
        .arg("--archive-type")
        .arg(request.archive_type.as_str())
        .arg("--target")
        .arg(&request.target_dir)
        .arg("--log")
        .arg(&request.log_path);
    command
}

/// Entry point of the out-of-process apply step. Extracts, applies, rolls
/// back on failure, and reduces the result to the closed exit code set.
pub fn run_apply(request: &ApplyRequest) -> ApplyExit {
    match run_apply_inner(request) {
        Ok(()) => ApplyExit::Success,
        Err(err) => {
            eprintln!("apply failed: {err}");
            match err {
                ApplyError::Permission(_) => ApplyExit::Permission,
                ApplyError::InUse(_) => ApplyExit::InUse,
                ApplyError::CorruptArchive(_) => ApplyExit::CorruptArchive,
                ApplyError::WrongSize(_) => ApplyExit::WrongSize,
                ApplyError::Cancelled => ApplyExit::Cancelled,
                ApplyError::Generic(_) => ApplyExit::Generic,
            }
        }
    }
}

fn run_apply_inner(request: &ApplyRequest) -> Result<(), ApplyError> {
    // A sentinel left over from an earlier cancelled attempt must not kill
    // this one.
    let _ = fs::remove_file(request.cancel_path());

    let work_dir = request.work_dir();
    if work_dir.exists() {
        fs::remove_dir_all(&work_dir).map_err(|err| {
            ApplyError::Generic(anyhow::anyhow!(
                "failed to clear work dir {}: {err}",
                work_dir.display()
            ))
        })?;
    }

    extract_archive(&request.archive_path, &work_dir, request.archive_type)
        .map_err(|err| ApplyError::CorruptArchive(format!("{err:#}")))?;

    let result = apply_extracted(
        &work_dir,
        &request.target_dir,
        &request.log_path,
        &request.backup_dir(),
        &request.cancel_path(),
    );
    let _ = fs::remove_dir_all(&work_dir);
    result
}

/// Asks a running worker to stop between file actions. The worker rolls the
/// attempt back and exits with the cancelled code; the tree is never left
/// half-written.
pub fn request_cancel(request: &ApplyRequest) -> Result<()> {
    let cancel_path = request.cancel_path();
    if let Some(parent) = cancel_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&cancel_path, b"cancel\n")
        .with_context(|| format!("failed to write cancel sentinel: {}", cancel_path.display()))
}
