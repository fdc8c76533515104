mod archive;
mod layout;
mod status;
mod update;
mod version;

pub use archive::ArchiveType;
pub use layout::UpdateLayout;
pub use status::{read_status_file, write_status_file, StatusState, UpdateStatus};
pub use update::{
    FailureReason, HashAlgorithm, Patch, PatchDescriptor, PatchState, PatchType, Update,
    UpdateDescriptor, UpdateState, UpdateType,
};
pub use version::{compare_versions, is_valid_version};

#[cfg(test)]
mod tests;
