use std::fs;
use std::time::Duration;

use anyhow::{anyhow, Result};
use upshift_applier::{
    default_swap_strategy, has_commit, read_entries, rollback_from_log, stage_copy,
    swap_with_retries, ApplyOutcome, ApplyRequest, ElevationBroker, ElevationOutcome,
    PatchApplier, SwapStrategy,
};
use upshift_core::{
    ArchiveType, FailureReason, PatchState, PatchType, StatusState, UpdateState, UpdateStatus,
};
use upshift_downloader::{DownloadControl, DownloadOutcome, Fetcher, ProgressReport};
use upshift_manager::UpdateManager;

use crate::events::{EventSink, LifecycleEvent, NullSink};

/// Whether the patch lands on the live install tree now, or on a shadow
/// copy that is swapped in at next launch. The caller picks; the machine
/// never decides this on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Direct,
    Staged,
}

/// Drives one active update through its whole lifecycle: download with
/// verification fallback, apply with privilege fallback, staged swap, and
/// crash recovery. All collaborators arrive at construction; there are no
/// ambient lookups.
pub struct UpdateEngine {
    manager: UpdateManager,
    fetcher: Box<dyn Fetcher>,
    applier: Box<dyn PatchApplier>,
    elevation: ElevationBroker,
    swap: Box<dyn SwapStrategy>,
    events: Box<dyn EventSink>,
    swap_attempts: u32,
    swap_retry_delay: Duration,
}

impl UpdateEngine {
    pub fn new(
        manager: UpdateManager,
        fetcher: Box<dyn Fetcher>,
        applier: Box<dyn PatchApplier>,
        elevation: ElevationBroker,
    ) -> Self {
        Self {
            manager,
            fetcher,
            applier,
            elevation,
            swap: default_swap_strategy(),
            events: Box::new(NullSink),
            swap_attempts: 3,
            swap_retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_swap_strategy(mut self, swap: Box<dyn SwapStrategy>) -> Self {
        self.swap = swap;
        self
    }

    pub fn with_event_sink(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_swap_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.swap_attempts = attempts;
        self.swap_retry_delay = delay;
        self
    }

    pub fn manager(&self) -> &UpdateManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut UpdateManager {
        &mut self.manager
    }

    /// Runs the full ladder to a terminal or resumable state: download,
    /// apply, and the post-apply re-download when a partial patch turns out
    /// not to fit this install.
    pub fn run(
        &mut self,
        mode: ApplyMode,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
    ) -> Result<UpdateState> {
        loop {
            let state = self.run_download(control, progress)?;
            if state != UpdateState::Pending {
                return Ok(state);
            }
            match self.run_apply(mode)? {
                UpdateState::Downloading => continue,
                state => return Ok(state),
            }
        }
    }

    pub fn run_download(
        &mut self,
        control: &DownloadControl,
        progress: &mut dyn FnMut(ProgressReport),
    ) -> Result<UpdateState> {
        if self.manager.active_update().is_none() {
            return Err(anyhow!("no active update to download"));
        }

        self.manager
            .write_status(UpdateStatus::new(StatusState::Downloading))?;
        self.transition(UpdateState::Downloading, None)?;

        let layout = self.manager.layout().clone();
        let outcome = {
            let update = self
                .manager
                .active_update_mut()
                .expect("active update checked above");
            self.fetcher.fetch(update, &layout, control, progress)?
        };

        match outcome {
            DownloadOutcome::Success => {
                self.manager
                    .write_status(UpdateStatus::new(StatusState::Pending))?;
                self.transition(UpdateState::Pending, None)?;
                Ok(UpdateState::Pending)
            }
            DownloadOutcome::Aborted => {
                // Stays resumable; the partial file and the pending patch
                // survive for a later attempt.
                self.manager.save()?;
                Ok(UpdateState::Downloading)
            }
            DownloadOutcome::VerificationFailed => self.fail(FailureReason::VerificationFailed),
            DownloadOutcome::NetworkError(_) => self.fail(FailureReason::Network),
        }
    }

    pub fn run_apply(&mut self, mode: ApplyMode) -> Result<UpdateState> {
        let layout = self.manager.layout().clone();
        let archive_type = {
            let update = self
                .manager
                .active_update()
                .ok_or_else(|| anyhow!("no active update to apply"))?;
            if update.state != UpdateState::Pending {
                return Err(anyhow!(
                    "update '{}' is not ready to apply (state: {})",
                    update.id,
                    update.state.as_str()
                ));
            }
            let patch = update
                .selected_patch()
                .ok_or_else(|| anyhow!("update '{}' has no selected patch", update.id))?;
            ArchiveType::infer_from_url(&patch.url).unwrap_or(ArchiveType::TarGz)
        };

        let target_dir = match mode {
            ApplyMode::Direct => layout.install_dir().to_path_buf(),
            ApplyMode::Staged => layout.stage_dir(),
        };
        let request = ApplyRequest::from_layout(&layout, archive_type, target_dir);
        if !request.archive_path.exists() {
            return Err(anyhow!(
                "no downloaded archive to apply: {}",
                request.archive_path.display()
            ));
        }

        // The marker lands before the first action that cannot be cleanly
        // undone, so a crash mid-apply is recoverable at next launch.
        self.manager
            .write_status(UpdateStatus::new(StatusState::Applying))?;
        match mode {
            ApplyMode::Direct => self.transition(UpdateState::Applying, None)?,
            ApplyMode::Staged => {
                self.transition(UpdateState::Staging, None)?;
                stage_copy(&layout)?;
            }
        }
        self.set_selected_patch_state(PatchState::Applying)?;

        let outcome = self.applier.apply(&request)?;
        self.handle_apply_outcome(outcome, &request, mode)
    }

    fn handle_apply_outcome(
        &mut self,
        outcome: ApplyOutcome,
        request: &ApplyRequest,
        mode: ApplyMode,
    ) -> Result<UpdateState> {
        match (outcome, mode) {
            (ApplyOutcome::Succeeded, ApplyMode::Direct) => self.succeed(),
            (ApplyOutcome::Succeeded, ApplyMode::Staged) => {
                self.set_selected_patch_state(PatchState::Applied)?;
                self.manager
                    .write_status(UpdateStatus::new(StatusState::Applied))?;
                self.transition(UpdateState::Applied, None)?;
                Ok(UpdateState::Applied)
            }

            (ApplyOutcome::FailedPermission | ApplyOutcome::FailedInUse, ApplyMode::Direct) => {
                // One elevated retry with the identical request, then done.
                self.manager
                    .write_status(UpdateStatus::new(StatusState::PendingService))?;
                self.transition(UpdateState::ApplyingService, None)?;
                match self.elevation.elevate(request)? {
                    ElevationOutcome::Applied(ApplyOutcome::Succeeded) => self.succeed(),
                    ElevationOutcome::Applied(elevated) => {
                        self.set_selected_patch_state(PatchState::FailedApply)?;
                        self.fail(reason_for_outcome(elevated))
                    }
                    ElevationOutcome::Unavailable => {
                        self.set_selected_patch_state(PatchState::FailedApply)?;
                        self.fail(FailureReason::ElevationUnavailable)
                    }
                }
            }
            (ApplyOutcome::FailedPermission, ApplyMode::Staged) => {
                // The stage dir is user-owned; a permission failure there is
                // real, not an elevation candidate.
                self.set_selected_patch_state(PatchState::FailedApply)?;
                self.fail(FailureReason::PermissionDenied)
            }
            (ApplyOutcome::FailedInUse, ApplyMode::Staged) => {
                self.set_selected_patch_state(PatchState::FailedApply)?;
                self.fail(FailureReason::FileInUse)
            }

            (ApplyOutcome::FailedCorrupt | ApplyOutcome::FailedWrongSize, _) => {
                self.set_selected_patch_state(PatchState::FailedApply)?;
                let can_fall_back = self
                    .manager
                    .active_update()
                    .map(|update| update.can_fall_back_to_complete())
                    .unwrap_or(false);
                if can_fall_back {
                    let update = self
                        .manager
                        .active_update_mut()
                        .expect("active update checked above");
                    update.select_patch(PatchType::Complete)?;
                    let _ = fs::remove_file(&request.archive_path);
                    self.manager
                        .write_status(UpdateStatus::new(StatusState::Downloading))?;
                    self.transition(UpdateState::Downloading, None)?;
                    Ok(UpdateState::Downloading)
                } else {
                    self.fail(reason_for_outcome(outcome))
                }
            }

            (ApplyOutcome::FailedGeneric(code), _) => {
                self.set_selected_patch_state(PatchState::FailedApply)?;
                self.fail(FailureReason::Generic(code))
            }
        }
    }

    /// Swaps a staged tree into place at next launch. Re-running after a
    /// completed swap is a no-op, detected through the status marker.
    pub fn finalize(&mut self) -> Result<UpdateState> {
        let layout = self.manager.layout().clone();
        let status = self.manager.read_status()?;
        match status.map(|status| status.state) {
            Some(StatusState::Succeeded) => Ok(UpdateState::Succeeded),
            Some(StatusState::Applied) => {
                let staged = layout.stage_dir();
                if !staged.exists() {
                    return Err(anyhow!(
                        "status marker says applied but there is no staged tree: {}",
                        staged.display()
                    ));
                }
                match swap_with_retries(
                    self.swap.as_ref(),
                    &staged,
                    layout.install_dir(),
                    self.swap_attempts,
                    self.swap_retry_delay,
                ) {
                    Ok(()) => self.succeed(),
                    Err(_) => self.fail(FailureReason::SwapError),
                }
            }
            other => Err(anyhow!(
                "no staged update to finalize (status marker: {})",
                other.map(|state| state.as_str()).unwrap_or("absent")
            )),
        }
    }

    /// Crash recovery at launch. A marker stuck at `applying` with no commit
    /// record means the attempt died mid-write: the tree is rolled back from
    /// the install log and the update fails cleanly. A commit record without
    /// the final marker means only the bookkeeping was lost.
    pub fn recover(&mut self) -> Result<Option<UpdateState>> {
        let layout = self.manager.layout().clone();
        let Some(status) = self.manager.read_status()? else {
            return Ok(None);
        };
        if self.manager.active_update().is_none() {
            return Ok(None);
        }

        match status.state {
            StatusState::Applying | StatusState::PendingService => {
                let was_staging = matches!(
                    self.manager.active_update().map(|update| update.state),
                    Some(UpdateState::Staging)
                );
                let entries = read_entries(&layout.install_log_path())?;
                if has_commit(&entries) {
                    if was_staging {
                        self.set_selected_patch_state(PatchState::Applied)?;
                        self.manager
                            .write_status(UpdateStatus::new(StatusState::Applied))?;
                        self.transition(UpdateState::Applied, None)?;
                        Ok(Some(UpdateState::Applied))
                    } else {
                        Ok(Some(self.succeed()?))
                    }
                } else {
                    if was_staging {
                        // The live tree was never touched; discarding the
                        // shadow copy is the whole rollback.
                        let _ = fs::remove_dir_all(layout.stage_dir());
                    } else {
                        rollback_from_log(
                            &layout.install_log_path(),
                            layout.install_dir(),
                            &layout.backup_dir(),
                        )?;
                    }
                    self.set_selected_patch_state(PatchState::FailedApply)?;
                    Ok(Some(self.fail(FailureReason::Generic(1))?))
                }
            }
            StatusState::Applied => self.finalize().map(Some),
            _ => Ok(None),
        }
    }

    fn transition(&mut self, new_state: UpdateState, reason: Option<FailureReason>) -> Result<()> {
        let event = {
            let update = self
                .manager
                .active_update_mut()
                .ok_or_else(|| anyhow!("no active update to transition"))?;
            let old_state = update.state;
            update.state = new_state;
            if let Some(reason) = reason {
                update.error_code = Some(reason.code());
            }
            LifecycleEvent {
                update_id: update.id.clone(),
                old_state,
                new_state,
                reason_code: reason.map(FailureReason::code),
            }
        };
        self.manager.save()?;
        self.events.emit(event);
        Ok(())
    }

    fn set_selected_patch_state(&mut self, state: PatchState) -> Result<()> {
        if let Some(patch) = self
            .manager
            .active_update_mut()
            .and_then(|update| update.selected_patch_mut())
        {
            patch.state = state;
        }
        self.manager.save()
    }

    fn succeed(&mut self) -> Result<UpdateState> {
        self.set_selected_patch_state(PatchState::Succeeded)?;
        self.manager
            .write_status(UpdateStatus::new(StatusState::Succeeded))?;
        self.transition(UpdateState::Succeeded, None)?;
        self.manager.retire_active(UpdateState::Succeeded, None)?;
        self.archive_install_log()?;
        Ok(UpdateState::Succeeded)
    }

    fn fail(&mut self, reason: FailureReason) -> Result<UpdateState> {
        self.manager.write_status(UpdateStatus::failed(reason.code()))?;
        self.transition(UpdateState::Failed, Some(reason))?;
        self.manager
            .retire_active(UpdateState::Failed, Some(reason.code()))?;
        Ok(UpdateState::Failed)
    }

    /// Post-completion housekeeping: the attempt's install log becomes the
    /// last-update log and the working area is cleared.
    fn archive_install_log(&self) -> Result<()> {
        let layout = self.manager.layout();
        let log = layout.install_log_path();
        if log.exists() {
            let last = layout.last_log_path();
            if last.exists() {
                let _ = fs::remove_file(&last);
            }
            let _ = fs::rename(&log, &last);
        }
        let _ = fs::remove_dir_all(layout.patch_dir());
        let _ = fs::remove_dir_all(layout.stage_dir());
        Ok(())
    }
}

fn reason_for_outcome(outcome: ApplyOutcome) -> FailureReason {
    match outcome {
        ApplyOutcome::Succeeded => FailureReason::Generic(0),
        ApplyOutcome::FailedPermission => FailureReason::PermissionDenied,
        ApplyOutcome::FailedInUse => FailureReason::FileInUse,
        ApplyOutcome::FailedCorrupt => FailureReason::CorruptArchive,
        ApplyOutcome::FailedWrongSize => FailureReason::WrongSize,
        ApplyOutcome::FailedGeneric(code) => FailureReason::Generic(code),
    }
}
