use std::fs;
use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use upshift_core::PatchType;

pub const MANIFEST_FILE_NAME: &str = "patch.manifest";
pub const PAYLOAD_DIR_NAME: &str = "files";

/// One file-level action declared by a patch archive. `Replace` carries the
/// expected pre-image of the file being replaced; a mismatch means the patch
/// was built against a different install and must not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Add {
        path: String,
    },
    Replace {
        path: String,
        source_size: u64,
        source_sha256: String,
    },
    Remove {
        path: String,
    },
}

impl FileAction {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    pub fn has_payload(&self) -> bool {
        matches!(self, Self::Add { .. } | Self::Replace { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchManifest {
    pub format_version: u32,
    pub patch_type: PatchType,
    pub actions: Vec<FileAction>,
}

impl PatchManifest {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut format_version = None;
        let mut patch_type = None;
        let mut actions = Vec::new();

        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(anyhow!("invalid patch manifest line: {line}"));
            };
            match key {
                "format_version" => {
                    format_version =
                        Some(value.parse().context("format_version must be an integer")?)
                }
                "patch_type" => {
                    patch_type = Some(
                        PatchType::parse(value)
                            .ok_or_else(|| anyhow!("unknown patch_type: {value}"))?,
                    )
                }
                "add" => {
                    validated_relative_path(value)?;
                    actions.push(FileAction::Add {
                        path: value.to_string(),
                    });
                }
                "replace" => {
                    let mut fields = value.split('|');
                    let path = fields
                        .next()
                        .ok_or_else(|| anyhow!("replace entry missing path: {line}"))?;
                    let source_size = fields
                        .next()
                        .ok_or_else(|| anyhow!("replace entry missing source size: {line}"))?
                        .parse()
                        .with_context(|| format!("invalid replace source size: {line}"))?;
                    let source_sha256 = fields
                        .next()
                        .ok_or_else(|| anyhow!("replace entry missing source hash: {line}"))?;
                    if fields.next().is_some() {
                        return Err(anyhow!("replace entry has trailing fields: {line}"));
                    }
                    validated_relative_path(path)?;
                    actions.push(FileAction::Replace {
                        path: path.to_string(),
                        source_size,
                        source_sha256: source_sha256.to_ascii_lowercase(),
                    });
                }
                "remove" => {
                    validated_relative_path(value)?;
                    actions.push(FileAction::Remove {
                        path: value.to_string(),
                    });
                }
                _ => {}
            }
        }

        let format_version: u32 = format_version.context("missing format_version")?;
        if format_version != 1 {
            return Err(anyhow!(
                "unsupported patch manifest format_version: {format_version}"
            ));
        }
        let patch_type = patch_type.context("missing patch_type")?;
        if actions.is_empty() {
            return Err(anyhow!("patch manifest declares no actions"));
        }
        if patch_type == PatchType::Complete
            && actions
                .iter()
                .any(|action| matches!(action, FileAction::Replace { .. }))
        {
            return Err(anyhow!(
                "complete patches must not declare pre-image replace entries"
            ));
        }

        Ok(Self {
            format_version,
            patch_type,
            actions,
        })
    }

    pub fn serialize(&self) -> String {
        let mut payload = String::new();
        payload.push_str(&format!("format_version={}\n", self.format_version));
        payload.push_str(&format!("patch_type={}\n", self.patch_type.as_str()));
        for action in &self.actions {
            match action {
                FileAction::Add { path } => payload.push_str(&format!("add={path}\n")),
                FileAction::Replace {
                    path,
                    source_size,
                    source_sha256,
                } => payload.push_str(&format!("replace={path}|{source_size}|{source_sha256}\n")),
                FileAction::Remove { path } => payload.push_str(&format!("remove={path}\n")),
            }
        }
        payload
    }

    /// Reads the manifest from an extracted archive directory.
    pub fn load(extracted_dir: &Path) -> Result<Self> {
        let path = extracted_dir.join(MANIFEST_FILE_NAME);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read patch manifest: {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to parse patch manifest: {}", path.display()))
    }
}

pub(crate) fn validated_relative_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("manifest path must not be empty"));
    }
    if relative.is_absolute() {
        return Err(anyhow!("manifest path must be relative: {path}"));
    }
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(anyhow!("manifest path must not include '..': {path}"));
    }
    Ok(relative)
}
