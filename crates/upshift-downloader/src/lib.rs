use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use upshift_core::{
    ArchiveType, Patch, PatchState, PatchType, Update, UpdateLayout,
};
use upshift_verify::{verify_patch, VerifyFailure};

const CONTROL_RUN: u8 = 0;
const CONTROL_PAUSE: u8 = 1;
const CONTROL_ABORT: u8 = 2;

/// Shared pause/abort switch for an in-flight transfer. The UI thread flips
/// it; the transfer loop polls it between chunks.
#[derive(Debug, Default)]
pub struct DownloadControl {
    state: AtomicU8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Abort,
}

impl DownloadControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.state.store(CONTROL_PAUSE, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.state.store(CONTROL_ABORT, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.state.store(CONTROL_RUN, Ordering::SeqCst);
    }

    pub fn signal(&self) -> ControlSignal {
        match self.state.load(Ordering::SeqCst) {
            CONTROL_PAUSE => ControlSignal::Pause,
            CONTROL_ABORT => ControlSignal::Abort,
            _ => ControlSignal::Run,
        }
    }
}

/// Raw progress triple. Presentation (units, rates, time remaining) is
/// layered on top by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressReport {
    pub bytes_so_far: u64,
    pub total_bytes: u64,
    pub elapsed_seconds: u64,
}

/// Terminal outcome of fetching the active update's archive. Internal
/// fallback from a partial to the complete patch is resolved before any of
/// these is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success,
    Aborted,
    VerificationFailed,
    NetworkError(String),
}

pub trait Fetcher {
    fn fetch(
        &self,
        update: &mut Update,
        layout: &UpdateLayout,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
    ) -> Result<DownloadOutcome>;
}

pub struct Downloader {
    client: Client,
    max_retries: u32,
    retry_delay: Duration,
}

enum TransferEnd {
    Complete,
    Interrupted,
}

enum TransferError {
    Network(anyhow::Error),
    Local(anyhow::Error),
}

impl Downloader {
    pub fn new(max_retries: u32) -> Self {
        Self {
            client: Client::new(),
            max_retries,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// One bounded transfer attempt loop for a single patch file. Network
    /// errors retry here; pause/abort surfaces as an interruption with the
    /// partial file kept for later resumption.
    fn transfer(
        &self,
        url: &str,
        part_path: &Path,
        total_bytes: u64,
        patch: &mut Patch,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
    ) -> Result<std::result::Result<TransferEnd, String>> {
        let started = Instant::now();
        let mut attempts = 0;
        loop {
            match self.transfer_once(url, part_path, total_bytes, patch, control, progress, started)
            {
                Ok(end) => return Ok(Ok(end)),
                Err(TransferError::Local(err)) => return Err(err),
                Err(TransferError::Network(err)) => {
                    attempts += 1;
                    if attempts > self.max_retries {
                        return Ok(Err(format!("{err:#}")));
                    }
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn transfer_once(
        &self,
        url: &str,
        part_path: &Path,
        total_bytes: u64,
        patch: &mut Patch,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
        started: Instant,
    ) -> std::result::Result<TransferEnd, TransferError> {
        if let Some(parent) = part_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .map_err(TransferError::Local)?;
        }

        let offset = fs::metadata(part_path).map(|meta| meta.len()).unwrap_or(0);
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let mut response = request
            .send()
            .with_context(|| format!("request failed: {url}"))
            .map_err(TransferError::Network)?;
        if !response.status().is_success() {
            return Err(TransferError::Network(anyhow!(
                "download failed with HTTP {}: {url}",
                response.status()
            )));
        }

        // A 206 continues the existing partial file; anything else means the
        // server ignored the range request and the transfer restarts clean.
        let (mut file, mut written) =
            if offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .open(part_path)
                    .with_context(|| {
                        format!("failed to reopen partial download: {}", part_path.display())
                    })
                    .map_err(TransferError::Local)?;
                (file, offset)
            } else {
                let file = fs::File::create(part_path)
                    .with_context(|| {
                        format!("failed to create download file: {}", part_path.display())
                    })
                    .map_err(TransferError::Local)?;
                (file, 0)
            };

        let mut buffer = [0u8; 16384];
        loop {
            match control.signal() {
                ControlSignal::Run => {}
                ControlSignal::Pause | ControlSignal::Abort => {
                    file.flush()
                        .with_context(|| {
                            format!("failed to flush partial download: {}", part_path.display())
                        })
                        .map_err(TransferError::Local)?;
                    patch.progress_bytes = written;
                    return Ok(TransferEnd::Interrupted);
                }
            }

            let read = response
                .read(&mut buffer)
                .context("transfer interrupted")
                .map_err(TransferError::Network)?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .with_context(|| format!("failed to write download: {}", part_path.display()))
                .map_err(TransferError::Local)?;
            written += read as u64;
            patch.progress_bytes = written;
            progress(ProgressReport {
                bytes_so_far: written,
                total_bytes,
                elapsed_seconds: started.elapsed().as_secs(),
            });
        }

        file.flush()
            .with_context(|| format!("failed to flush download: {}", part_path.display()))
            .map_err(TransferError::Local)?;
        Ok(TransferEnd::Complete)
    }
}

impl Fetcher for Downloader {
    fn fetch(
        &self,
        update: &mut Update,
        layout: &UpdateLayout,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
    ) -> Result<DownloadOutcome> {
        layout.ensure_base_dirs()?;

        loop {
            let (patch_type, url, byte_size, algorithm, hash_value) = {
                let patch = update
                    .selected_patch()
                    .ok_or_else(|| anyhow!("update '{}' has no selected patch", update.id))?;
                (
                    patch.patch_type,
                    patch.url.clone(),
                    patch.byte_size,
                    patch.hash_algorithm,
                    patch.hash_value.clone(),
                )
            };

            let archive_type = ArchiveType::infer_from_url(&url).unwrap_or(ArchiveType::TarGz);
            let archive_path = layout.archive_path(archive_type);
            let part_path = layout.archive_part_path(archive_type);

            let end = {
                let patch = update
                    .selected_patch_mut()
                    .expect("selected patch checked above");
                patch.state = PatchState::Downloading;
                self.transfer(&url, &part_path, byte_size, patch, control, progress)?
            };

            match end {
                Ok(TransferEnd::Interrupted) => {
                    let patch = update
                        .selected_patch_mut()
                        .expect("selected patch checked above");
                    patch.state = PatchState::Pending;
                    return Ok(DownloadOutcome::Aborted);
                }
                Err(detail) => {
                    let patch = update
                        .selected_patch_mut()
                        .expect("selected patch checked above");
                    patch.state = PatchState::Pending;
                    return Ok(DownloadOutcome::NetworkError(detail));
                }
                Ok(TransferEnd::Complete) => {}
            }

            fs::rename(&part_path, &archive_path).with_context(|| {
                format!(
                    "failed to move completed download into place: {}",
                    archive_path.display()
                )
            })?;

            match verify_patch(&archive_path, byte_size, algorithm, &hash_value) {
                Ok(()) => {
                    let patch = update
                        .selected_patch_mut()
                        .expect("selected patch checked above");
                    patch.state = PatchState::PendingApply;
                    patch.progress_bytes = byte_size;
                    return Ok(DownloadOutcome::Success);
                }
                Err(VerifyFailure::Unreadable(detail)) => {
                    return Err(anyhow!(
                        "cannot verify downloaded archive {}: {detail}",
                        archive_path.display()
                    ));
                }
                Err(_) => {
                    let _ = fs::remove_file(&archive_path);
                    let patch = update
                        .selected_patch_mut()
                        .expect("selected patch checked above");
                    patch.state = PatchState::FailedVerification;
                    patch.progress_bytes = 0;

                    if patch_type == PatchType::Partial && update.can_fall_back_to_complete() {
                        // Restart from byte 0 of the complete sibling; the
                        // caller only ever observes the final outcome.
                        update.select_patch(PatchType::Complete)?;
                        remove_stale_transfers(layout)?;
                        continue;
                    }
                    return Ok(DownloadOutcome::VerificationFailed);
                }
            }
        }
    }
}

fn remove_stale_transfers(layout: &UpdateLayout) -> Result<()> {
    for archive_type in [ArchiveType::TarGz, ArchiveType::Zip] {
        for path in [
            layout.archive_path(archive_type),
            layout.archive_part_path(archive_type),
        ] {
            if path.exists() {
                fs::remove_file(&path).with_context(|| {
                    format!("failed to remove stale transfer file: {}", path.display())
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
