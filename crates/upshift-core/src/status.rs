use std::fs;
use std::io;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

/// State token persisted in the status marker file. This is the contract the
/// resume/rollback pass reads at next launch, so the wire format is a single
/// line and must stay parseable by older builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Downloading,
    Applying,
    PendingService,
    Applied,
    Succeeded,
    Failed,
}

impl StatusState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Applying => "applying",
            Self::PendingService => "pending-service",
            Self::Applied => "applied",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "applying" => Some(Self::Applying),
            "pending-service" => Some(Self::PendingService),
            "applied" => Some(Self::Applied),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStatus {
    pub state: StatusState,
    pub error_code: Option<i32>,
}

impl UpdateStatus {
    pub fn new(state: StatusState) -> Self {
        Self {
            state,
            error_code: None,
        }
    }

    pub fn failed(error_code: i32) -> Self {
        Self {
            state: StatusState::Failed,
            error_code: Some(error_code),
        }
    }

    pub fn to_line(self) -> String {
        match self.error_code {
            Some(code) => format!("{}: {}", self.state.as_str(), code),
            None => self.state.as_str().to_string(),
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let (token, code) = match trimmed.split_once(':') {
            Some((token, code)) => (token.trim(), Some(code.trim())),
            None => (trimmed, None),
        };

        let state = StatusState::parse(token)
            .ok_or_else(|| anyhow!("unknown update status token: {trimmed}"))?;
        let error_code = match code {
            Some(raw) => Some(
                raw.parse::<i32>()
                    .with_context(|| format!("invalid update status error code: {trimmed}"))?,
            ),
            None => None,
        };
        Ok(Self { state, error_code })
    }
}

/// Writes the marker atomically (temp file + rename) so a crash mid-write
/// can never leave a torn marker behind.
pub fn write_status_file(path: &Path, status: UpdateStatus) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = path.with_extension("status.tmp");
    fs::write(&tmp_path, format!("{}\n", status.to_line())).with_context(|| {
        format!("failed to write status marker temp file: {}", tmp_path.display())
    })?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to commit status marker: {}", path.display()))?;
    Ok(())
}

pub fn read_status_file(path: &Path) -> Result<Option<UpdateStatus>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read status marker: {}", path.display()));
        }
    };

    let line = raw.trim();
    if line.is_empty() {
        return Ok(None);
    }
    UpdateStatus::parse(line)
        .with_context(|| format!("failed to parse status marker: {}", path.display()))
        .map(Some)
}
