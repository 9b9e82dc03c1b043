// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that Archivist uses to
//! simplify serialization and deserialization. File I/O is left to the
//! caller to figure out.
//!
//! # General Layout
//!
//! The configuration file is split into five sections:
//!
//! - `[storage]` where cached files and project records are kept.
//! - `[network]` timeouts for remote probes and downloads.
//! - `[maintenance]` worker pool size and interval of maintenance passes.
//! - `[labor]` worker pool size, line-counting tool, and effort model URL.
//! - `[github]` optional credentials for release downloads.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Path values go through shell expansion, so `$HOME` and `~` work.

use crate::path::{default_data_dir, NoWayHome, StorageLayout};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

/// Archivist configuration layout.
#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageSettings,
    pub network: NetworkSettings,
    pub maintenance: MaintenanceSettings,
    pub labor: LaborSettings,
    pub github: GithubSettings,
}

impl Settings {
    /// Construct settings with storage rooted at default data directory.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if data directory cannot be determined.
    pub fn try_default() -> Result<Self, NoWayHome> {
        let data = default_data_dir()?;
        let mut settings = Self::default();
        settings.storage = StorageSettings {
            archive_dir: data.join("archive"),
            limited_archive_dir: data.join("limited"),
            store_file: data.join("projects.json"),
        };
        Ok(settings)
    }

    /// Storage layout described by these settings.
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(
            &self.storage.archive_dir,
            &self.storage.limited_archive_dir,
        )
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let storage = &mut settings.storage;
        storage.archive_dir = expand(&storage.archive_dir)?;
        storage.limited_archive_dir = expand(&storage.limited_archive_dir)?;
        storage.store_file = expand(&storage.store_file)?;
        settings.labor.cloc = settings.labor.cloc.as_deref().map(expand).transpose()?;

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Locations of cached files and project records.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base directory of standard projects.
    pub archive_dir: PathBuf,

    /// Base directory of restricted projects.
    pub limited_archive_dir: PathBuf,

    /// JSON snapshot of project records.
    pub store_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("archive"),
            limited_archive_dir: PathBuf::from("limited"),
            store_file: PathBuf::from("projects.json"),
        }
    }
}

/// Timeouts for remote access, in seconds.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Lightweight remote probes and version control transfers.
    pub probe_timeout: u64,

    /// Release tarball downloads and effort model lookups.
    pub download_timeout: u64,
}

impl NetworkSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout)
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_timeout: 10,
            download_timeout: 60,
        }
    }
}

/// Maintenance pass settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    /// Number of mirrors synchronized concurrently.
    pub workers: usize,

    /// Seconds between scheduled maintenance passes.
    pub interval: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            interval: 24 * 60 * 60,
        }
    }
}

/// Labor hour calculation settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LaborSettings {
    /// Number of projects estimated concurrently.
    pub workers: usize,

    /// Line-counting tool to run; no estimate is made without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloc: Option<PathBuf>,

    /// Effort model endpoint to post source line counts to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort_url: Option<String>,
}

impl Default for LaborSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            cloc: None,
            effort_url: None,
        }
    }
}

/// Credentials for the hosting platform API.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GithubSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn expand(path: &std::path::Path) -> Result<PathBuf, ConfigError> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}
