// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where configuration, project records, and cached project files
//! live on the file system.
//!
//! # Storage Layout
//!
//! Cached files are laid out as `<base-dir>/<project-id>/<entry>`, where the
//! entry is either an uploaded file name, or a uniquely named cache folder
//! generated at acquisition time. Projects flagged as restricted use a
//! separate base directory from standard projects, and the two base
//! directories never overlap.

use crate::project::{AccessClass, Project};

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};
use uuid::Uuid;

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/archivist/archivist.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if configuration directory cannot be determined.
pub fn default_config_path() -> Result<PathBuf, NoWayHome> {
    dirs::config_dir()
        .map(|path| path.join("archivist").join("archivist.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to data directory.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/archivist`. Does not check
/// if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if data directory cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_data_dir() -> Result<PathBuf, NoWayHome> {
    dirs::data_dir()
        .map(|path| path.join("archivist"))
        .ok_or(NoWayHome)
}

/// Disjoint base directories for cached project files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    standard: PathBuf,
    restricted: PathBuf,
}

impl StorageLayout {
    /// Construct new storage layout.
    pub fn new(standard: impl Into<PathBuf>, restricted: impl Into<PathBuf>) -> Self {
        Self {
            standard: standard.into(),
            restricted: restricted.into(),
        }
    }

    /// Base directory for target access class.
    pub fn base_dir(&self, access_class: AccessClass) -> &Path {
        match access_class {
            AccessClass::Standard => self.standard.as_path(),
            AccessClass::Restricted => self.restricted.as_path(),
        }
    }

    /// Directory exclusive to target project.
    pub fn project_dir(&self, project: &Project) -> PathBuf {
        self.base_dir(project.access_class)
            .join(project.id.to_string())
    }

    /// Where an uploaded file of target project is kept.
    ///
    /// Only the final component of the claimed file name is used.
    pub fn upload_path(&self, project: &Project, file_name: impl AsRef<Path>) -> Option<PathBuf> {
        file_name
            .as_ref()
            .file_name()
            .map(|name| self.project_dir(project).join(name))
    }

    /// Create uniquely named cache folder for target project.
    ///
    /// # Errors
    ///
    /// - Return [`std::io::Error`] if the folder cannot be created.
    pub fn fresh_cache_dir(&self, project: &Project) -> std::io::Result<PathBuf> {
        let path = self
            .project_dir(project)
            .join(Uuid::new_v4().to_string());
        create_dir_all(&path)?;
        Ok(path)
    }
}

/// No way to determine user's platform directories.
///
/// # See Also
///
/// - [`dirs::data_dir`](https://docs.rs/dirs/latest/dirs/fn.data_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's data or configuration directory")]
pub struct NoWayHome;
