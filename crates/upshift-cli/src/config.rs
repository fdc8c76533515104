use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use upshift_core::UpdateLayout;

pub const DEFAULT_CONFIG_FILE: &str = "upshift.toml";

/// Host-application settings for the update engine: where the install tree
/// lives, where update state goes, and which binaries run the apply step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub install_dir: Option<PathBuf>,
    pub updates_dir: Option<PathBuf>,
    /// Binary whose `apply-worker` entry point performs the out-of-process
    /// apply. Defaults to this executable.
    pub worker: Option<PathBuf>,
    /// Privileged helper used when an unprivileged apply fails for
    /// permission or in-use reasons. Elevation is unavailable without it.
    pub elevation_helper: Option<PathBuf>,
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
}

fn default_download_retries() -> u32 {
    2
}

impl UpdateConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("failed to parse upshift config")
    }

    /// Loads an explicit config path, or `upshift.toml` from the working
    /// directory when present, or built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    download_retries: default_download_retries(),
                    ..Self::default()
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config: {}", path.display()));
            }
        };
        Self::from_toml_str(&raw).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn layout(&self) -> Result<UpdateLayout> {
        let install_dir = match &self.install_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().context("cannot resolve working directory")?,
        };
        let updates_dir = match &self.updates_dir {
            Some(dir) => dir.clone(),
            None => install_dir.join("updates"),
        };
        Ok(UpdateLayout::new(install_dir, updates_dir))
    }

    pub fn worker_binary(&self) -> Result<PathBuf> {
        match &self.worker {
            Some(worker) => Ok(worker.clone()),
            None => std::env::current_exe().context("cannot resolve this executable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let raw = r#"
install_dir = "/opt/app"
updates_dir = "/var/lib/app/updates"
worker = "/opt/app/bin/upshift"
elevation_helper = "/usr/libexec/app-update-helper"
download_retries = 5
"#;
        let config = UpdateConfig::from_toml_str(raw).expect("config must parse");
        assert_eq!(config.install_dir.as_deref(), Some(Path::new("/opt/app")));
        assert_eq!(
            config.elevation_helper.as_deref(),
            Some(Path::new("/usr/libexec/app-update-helper"))
        );
        assert_eq!(config.download_retries, 5);

        let layout = config.layout().expect("layout must resolve");
        assert_eq!(layout.install_dir(), Path::new("/opt/app"));
        assert_eq!(layout.updates_dir(), Path::new("/var/lib/app/updates"));
    }

    #[test]
    fn updates_dir_defaults_next_to_the_install_dir() {
        let raw = r#"install_dir = "/opt/app""#;
        let config = UpdateConfig::from_toml_str(raw).expect("config must parse");
        assert_eq!(config.download_retries, 2);

        let layout = config.layout().expect("layout must resolve");
        assert_eq!(layout.updates_dir(), Path::new("/opt/app/updates"));
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config =
            UpdateConfig::load(Some(Path::new("upshift-config-that-does-not-exist.toml")))
                .expect("missing file must fall back to defaults");
        assert!(config.install_dir.is_none());
        assert!(config.elevation_helper.is_none());
        assert_eq!(config.download_retries, 2);
    }
}
