// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Acquirers whose content arrives as a file.

use super::{Acquire, AcquireError, Result};
use crate::{
    extract::extract_file,
    path::StorageLayout,
    project::{OriginType, Project},
    release::{is_tagged_release, tag_download_url, HttpReleaseFetcher, ReleaseFetcher},
};

use std::{
    fs::{create_dir_all, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Container image uploads.
///
/// Images are kept as uploaded, so the project directory itself becomes the
/// cache folder.
#[derive(Debug, Clone)]
pub struct ContainerAcquirer {
    layout: StorageLayout,
}

impl ContainerAcquirer {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }
}

impl Acquire for ContainerAcquirer {
    fn origin_type(&self) -> OriginType {
        OriginType::Container
    }

    fn claims(&self, project: &Project) -> bool {
        project.origin_type() == Some(OriginType::Container)
    }

    fn acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let folder = self.layout.project_dir(project);
        create_dir_all(&folder)?;
        Ok(folder)
    }
}

/// Uploaded source archives.
#[derive(Debug, Clone)]
pub struct FileAcquirer {
    layout: StorageLayout,
}

impl FileAcquirer {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }
}

impl Acquire for FileAcquirer {
    fn origin_type(&self) -> OriginType {
        OriginType::File
    }

    fn claims(&self, project: &Project) -> bool {
        project.origin_link.is_none() && project.uploaded_file.is_some()
    }

    fn acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let upload = project
            .uploaded_file
            .clone()
            .ok_or_else(|| AcquireError::Validation("no uploaded file to extract".into()))?;
        extract_into_fresh_dir(&self.layout, project, &upload)
    }
}

/// Tagged releases on the hosting platform.
#[derive(Debug, Clone)]
pub struct TaggedReleaseAcquirer<F = HttpReleaseFetcher>
where
    F: ReleaseFetcher,
{
    layout: StorageLayout,
    fetcher: F,
}

impl<F> TaggedReleaseAcquirer<F>
where
    F: ReleaseFetcher,
{
    pub fn new(layout: StorageLayout, fetcher: F) -> Self {
        Self { layout, fetcher }
    }
}

impl<F> Acquire for TaggedReleaseAcquirer<F>
where
    F: ReleaseFetcher,
{
    fn origin_type(&self) -> OriginType {
        OriginType::TaggedRelease
    }

    fn claims(&self, project: &Project) -> bool {
        project
            .origin_link
            .as_deref()
            .is_some_and(is_tagged_release)
    }

    fn acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let link = project.origin_link.clone().unwrap_or_default();
        let url = tag_download_url(&link).ok_or_else(|| {
            AcquireError::Validation(format!("cannot resolve release download for {link}"))
        })?;

        let archive = self
            .layout
            .project_dir(project)
            .join(format!("{}.tar.gz", project.id));
        self.fetcher.fetch(&url, &archive)?;
        debug!("release {url} saved to {:?}", archive.display());

        extract_into_fresh_dir(&self.layout, project, &archive)
    }
}

fn extract_into_fresh_dir(layout: &StorageLayout, project: &Project, archive: &Path) -> Result<PathBuf> {
    let folder = layout.fresh_cache_dir(project)?;
    match extract_file(archive, &folder) {
        Ok(folder) => Ok(folder),
        Err(error) => {
            // INVARIANT: Failed extraction never leaves a usable looking folder.
            if let Err(cleanup) = remove_dir_all(&folder) {
                warn!("failed to remove {:?}: {cleanup}", folder.display());
            }
            Err(error.into())
        }
    }
}
