use std::fs;
use std::io;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use upshift_core::{
    read_status_file, write_status_file, Update, UpdateLayout, UpdateState, UpdateStatus,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedUpdates {
    active: Option<Update>,
    #[serde(default)]
    history: Vec<Update>,
}

/// Owner of the persisted update collection: at most one mutable active
/// update plus an immutable history, newest first. Everything else reads
/// and writes update state through this type, which is what makes the
/// single-active-update invariant structural rather than a locking concern.
pub struct UpdateManager {
    layout: UpdateLayout,
    active: Option<Update>,
    history: Vec<Update>,
}

impl UpdateManager {
    pub fn load(layout: UpdateLayout) -> Result<Self> {
        let path = layout.history_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    layout,
                    active: None,
                    history: Vec::new(),
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read update history: {}", path.display()));
            }
        };

        let persisted: PersistedUpdates = toml::from_str(&raw)
            .with_context(|| format!("failed to parse update history: {}", path.display()))?;
        Ok(Self {
            layout,
            active: persisted.active,
            history: persisted.history,
        })
    }

    pub fn save(&self) -> Result<()> {
        let persisted = PersistedUpdates {
            active: self.active.clone(),
            history: self.history.clone(),
        };
        let raw = toml::to_string(&persisted).context("failed to serialize update history")?;

        let path = self.layout.history_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, raw.as_bytes()).with_context(|| {
            format!("failed to write update history temp file: {}", tmp_path.display())
        })?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to commit update history: {}", path.display()))?;
        Ok(())
    }

    pub fn layout(&self) -> &UpdateLayout {
        &self.layout
    }

    pub fn active_update(&self) -> Option<&Update> {
        self.active.as_ref()
    }

    pub fn active_update_mut(&mut self) -> Option<&mut Update> {
        self.active.as_mut()
    }

    /// Installs a new active update. There is exactly one slot; a second
    /// offer is rejected until the current one reaches a terminal state.
    pub fn begin_update(&mut self, update: Update) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(anyhow!(
                "an update is already active: {} ({})",
                active.id,
                active.state.as_str()
            ));
        }
        self.active = Some(update);
        self.save()
    }

    /// Moves the active update into history as an immutable record with its
    /// terminal state and reason code attached.
    pub fn retire_active(&mut self, state: UpdateState, error_code: Option<i32>) -> Result<()> {
        let mut update = self
            .active
            .take()
            .ok_or_else(|| anyhow!("no active update to retire"))?;
        update.state = state;
        update.error_code = error_code;
        self.history.insert(0, update);
        self.save()
    }

    /// Drops the active update without recording it, e.g. when the offer is
    /// withdrawn before anything was downloaded.
    pub fn clear_active(&mut self) -> Result<()> {
        self.active = None;
        self.save()
    }

    pub fn update_count(&self) -> usize {
        self.history.len()
    }

    /// History access, newest first.
    pub fn update_at(&self, index: usize) -> Option<&Update> {
        self.history.get(index)
    }

    pub fn write_status(&self, status: UpdateStatus) -> Result<()> {
        write_status_file(&self.layout.status_path(), status)
    }

    pub fn read_status(&self) -> Result<Option<UpdateStatus>> {
        read_status_file(&self.layout.status_path())
    }
}
