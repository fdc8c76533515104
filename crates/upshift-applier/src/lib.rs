mod apply;
mod elevate;
mod extract;
mod log;
mod manifest;
mod process;
mod swap;

pub use apply::{apply_extracted, rollback_from_log, ApplyError};
pub use elevate::{ElevationBroker, ElevationOutcome, ElevationStrategy, HelperElevation, NoElevation};
pub use extract::extract_archive;
pub use log::{
    has_commit, read_entries, InstallLog, InstallLogEntry, STEP_BACKUP, STEP_COMMIT, STEP_PREPARE,
    STEP_REMOVE, STEP_ROLLBACK, STEP_WRITE,
};
pub use manifest::{FileAction, PatchManifest, MANIFEST_FILE_NAME, PAYLOAD_DIR_NAME};
pub use process::{
    outcome_for_code, request_cancel, run_apply, ApplyExit, ApplyOutcome, ApplyRequest,
    InProcessApplier, PatchApplier, ProcessApplier,
};
pub use swap::{
    copy_tree, default_swap_strategy, stage_copy, swap_with_retries, CopySwap, RenameSwap,
    SwapStrategy,
};
