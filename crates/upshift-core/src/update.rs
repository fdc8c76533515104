use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::version::is_valid_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Minor,
    Major,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Major => "major",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    Partial,
    Complete,
}

impl PatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Partial => "partial",
            Self::Complete => "complete",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "partial" => Some(Self::Partial),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchState {
    Pending,
    Downloading,
    PendingApply,
    Applying,
    Applied,
    Succeeded,
    FailedVerification,
    FailedApply,
}

impl PatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::PendingApply => "pending-apply",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Succeeded => "succeeded",
            Self::FailedVerification => "failed-verification",
            Self::FailedApply => "failed-apply",
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::FailedVerification | Self::FailedApply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateState {
    Downloading,
    Pending,
    Staging,
    Applying,
    ApplyingService,
    Applied,
    Succeeded,
    Failed,
}

impl UpdateState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Pending => "pending",
            Self::Staging => "staging",
            Self::Applying => "applying",
            Self::ApplyingService => "applying-service",
            Self::Applied => "applied",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Closed set of reasons an update lands in the `failed` terminal state.
/// The numeric code is what the status marker and the history record carry;
/// generic failures keep whatever raw code the apply step exited with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Generic(i32),
    Network,
    PermissionDenied,
    FileInUse,
    CorruptArchive,
    WrongSize,
    VerificationFailed,
    SwapError,
    ElevationUnavailable,
}

impl FailureReason {
    pub fn code(self) -> i32 {
        match self {
            Self::Generic(code) => code,
            Self::Network => 2,
            Self::PermissionDenied => 3,
            Self::FileInUse => 4,
            Self::CorruptArchive => 5,
            Self::WrongSize => 6,
            Self::VerificationFailed => 7,
            Self::SwapError => 8,
            Self::ElevationUnavailable => 9,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::Network,
            3 => Self::PermissionDenied,
            4 => Self::FileInUse,
            5 => Self::CorruptArchive,
            6 => Self::WrongSize,
            7 => Self::VerificationFailed,
            8 => Self::SwapError,
            9 => Self::ElevationUnavailable,
            other => Self::Generic(other),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Generic(_) => "update failed",
            Self::Network => "download failed after retries",
            Self::PermissionDenied => "insufficient privileges to modify the install directory",
            Self::FileInUse => "a file in the install directory is in use",
            Self::CorruptArchive => "the patch archive does not match this install",
            Self::WrongSize => "a file in the install directory has an unexpected size",
            Self::VerificationFailed => "the downloaded patch failed verification",
            Self::SwapError => "the staged update could not be swapped into place",
            Self::ElevationUnavailable => "the privileged update helper is not available",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub patch_type: PatchType,
    pub url: String,
    pub hash_algorithm: HashAlgorithm,
    pub hash_value: String,
    pub byte_size: u64,
    #[serde(default = "default_patch_state")]
    pub state: PatchState,
    #[serde(default)]
    pub progress_bytes: u64,
    #[serde(default)]
    pub selected: bool,
}

fn default_patch_state() -> PatchState {
    PatchState::Pending
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub id: String,
    pub version: String,
    pub update_type: UpdateType,
    pub channel: String,
    pub details_url: Option<String>,
    pub license_url: Option<String>,
    pub state: UpdateState,
    #[serde(default)]
    pub error_code: Option<i32>,
    pub is_complete_update: bool,
    pub patches: Vec<Patch>,
}

impl Update {
    pub fn from_descriptor(descriptor: UpdateDescriptor) -> Result<Self> {
        let patches = descriptor
            .patches
            .into_iter()
            .map(|patch| Patch {
                patch_type: patch.patch_type,
                url: patch.url,
                hash_algorithm: patch.hash_algorithm,
                hash_value: patch.hash_value,
                byte_size: patch.byte_size,
                state: PatchState::Pending,
                progress_bytes: 0,
                selected: false,
            })
            .collect();

        let mut update = Self {
            id: descriptor.id,
            version: descriptor.version,
            update_type: descriptor.update_type,
            channel: descriptor.channel,
            details_url: descriptor.details_url,
            license_url: descriptor.license_url,
            state: UpdateState::Downloading,
            error_code: None,
            is_complete_update: false,
            patches,
        };
        update.validate()?;

        // Partial patches are preferred when offered; the complete sibling
        // stays in reserve for the fallback ladder.
        let initial = if update.patch_of_type(PatchType::Partial).is_some() {
            PatchType::Partial
        } else {
            PatchType::Complete
        };
        update.select_patch(initial)?;
        Ok(update)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_version(&self.version) {
            return Err(anyhow!("invalid update version: {}", self.version));
        }
        if self.patches.is_empty() {
            return Err(anyhow!("update '{}' offers no patches", self.id));
        }

        let partial_count = self
            .patches
            .iter()
            .filter(|patch| patch.patch_type == PatchType::Partial)
            .count();
        let complete_count = self
            .patches
            .iter()
            .filter(|patch| patch.patch_type == PatchType::Complete)
            .count();
        if partial_count > 1 || complete_count > 1 {
            return Err(anyhow!(
                "update '{}' offers duplicate patch types (partial={}, complete={})",
                self.id,
                partial_count,
                complete_count
            ));
        }
        if partial_count == 1 && complete_count == 0 {
            return Err(anyhow!(
                "update '{}' offers a partial patch without a complete fallback",
                self.id
            ));
        }

        let selected_count = self.patches.iter().filter(|patch| patch.selected).count();
        if selected_count > 1 {
            return Err(anyhow!(
                "update '{}' has {} selected patches",
                self.id,
                selected_count
            ));
        }
        Ok(())
    }

    pub fn selected_patch(&self) -> Option<&Patch> {
        self.patches.iter().find(|patch| patch.selected)
    }

    pub fn selected_patch_mut(&mut self) -> Option<&mut Patch> {
        self.patches.iter_mut().find(|patch| patch.selected)
    }

    pub fn patch_of_type(&self, patch_type: PatchType) -> Option<&Patch> {
        self.patches
            .iter()
            .find(|patch| patch.patch_type == patch_type)
    }

    pub fn patch_of_type_mut(&mut self, patch_type: PatchType) -> Option<&mut Patch> {
        self.patches
            .iter_mut()
            .find(|patch| patch.patch_type == patch_type)
    }

    pub fn select_patch(&mut self, patch_type: PatchType) -> Result<()> {
        if self.patch_of_type(patch_type).is_none() {
            return Err(anyhow!(
                "update '{}' has no {} patch to select",
                self.id,
                patch_type.as_str()
            ));
        }
        for patch in &mut self.patches {
            patch.selected = patch.patch_type == patch_type;
        }
        self.is_complete_update = patch_type == PatchType::Complete;
        Ok(())
    }

    /// Whether the fallback ladder still has an untried complete patch to
    /// fall back to from a failed partial.
    pub fn can_fall_back_to_complete(&self) -> bool {
        let Some(selected) = self.selected_patch() else {
            return false;
        };
        if selected.patch_type != PatchType::Partial {
            return false;
        }
        self.patch_of_type(PatchType::Complete)
            .map(|patch| !patch.state.is_failed())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDescriptor {
    #[serde(rename = "type")]
    pub patch_type: PatchType,
    pub url: String,
    pub hash_algorithm: HashAlgorithm,
    pub hash_value: String,
    pub byte_size: u64,
}

/// The parsed form of a remote update descriptor, as handed over by the
/// update discovery component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub id: String,
    pub version: String,
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub channel: String,
    pub details_url: Option<String>,
    pub license_url: Option<String>,
    #[serde(default)]
    pub patches: Vec<PatchDescriptor>,
}

impl UpdateDescriptor {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let descriptor: Self =
            toml::from_str(input).context("failed to parse update descriptor")?;
        if descriptor.id.trim().is_empty() {
            return Err(anyhow!("update descriptor id must not be empty"));
        }
        if !is_valid_version(&descriptor.version) {
            return Err(anyhow!(
                "update descriptor '{}' has an invalid version: {}",
                descriptor.id,
                descriptor.version
            ));
        }
        for patch in &descriptor.patches {
            if patch.url.trim().is_empty() {
                return Err(anyhow!(
                    "update descriptor '{}' has a {} patch without a URL",
                    descriptor.id,
                    patch.patch_type.as_str()
                ));
            }
            if patch.hash_value.trim().is_empty() {
                return Err(anyhow!(
                    "update descriptor '{}' has a {} patch without a hash",
                    descriptor.id,
                    patch.patch_type.as_str()
                ));
            }
            if patch.byte_size == 0 {
                return Err(anyhow!(
                    "update descriptor '{}' has a {} patch with zero size",
                    descriptor.id,
                    patch.patch_type.as_str()
                ));
            }
        }
        Ok(descriptor)
    }
}
