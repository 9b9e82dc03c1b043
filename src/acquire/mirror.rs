// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Acquirers whose content is a live version control mirror.

use super::{Acquire, Result};
use crate::{
    path::StorageLayout,
    project::{git_link, normalize_link, OriginType, Project},
    vcs::{git, svn},
};

use std::{
    fs::remove_dir_all,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, warn};

/// Layer of indirection for remote repositories.
pub trait VcsRemote: Send + Sync {
    /// Check that link is a reachable remote of this kind.
    fn probe(&self, url: &str) -> Result<()>;

    /// Check out remote into target folder.
    fn checkout(&self, url: &str, path: &Path) -> Result<()>;
}

/// Git remotes reached through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitRemote;

impl VcsRemote for GitRemote {
    fn probe(&self, url: &str) -> Result<()> {
        Ok(git::probe_remote(url)?)
    }

    fn checkout(&self, url: &str, path: &Path) -> Result<()> {
        git::clone_mirror(url, path)?;
        Ok(())
    }
}

/// Subversion remotes reached through the `svn` client.
#[derive(Debug, Clone, Copy)]
pub struct SvnRemote {
    timeout: Duration,
}

impl SvnRemote {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl VcsRemote for SvnRemote {
    fn probe(&self, url: &str) -> Result<()> {
        Ok(svn::probe_remote(url, self.timeout)?)
    }

    fn checkout(&self, url: &str, path: &Path) -> Result<()> {
        svn::checkout(url, path, self.timeout)?;
        Ok(())
    }
}

/// Git repositories.
///
/// Links are stored in their `.git` form once the probe succeeds.
#[derive(Debug, Clone)]
pub struct GitAcquirer<R = GitRemote>
where
    R: VcsRemote,
{
    layout: StorageLayout,
    remote: R,
}

impl<R> GitAcquirer<R>
where
    R: VcsRemote,
{
    pub fn new(layout: StorageLayout, remote: R) -> Self {
        Self { layout, remote }
    }
}

impl<R> Acquire for GitAcquirer<R>
where
    R: VcsRemote,
{
    fn origin_type(&self) -> OriginType {
        OriginType::Git
    }

    fn claims(&self, project: &Project) -> bool {
        let Some(link) = project.origin_link.as_deref() else {
            return false;
        };

        let url = git_link(normalize_link(link));
        match self.remote.probe(&url) {
            Ok(()) => true,
            Err(error) => {
                debug!("{url} is not a git remote: {error}");
                false
            }
        }
    }

    fn acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let url = git_link(normalize_link(project.origin_link.as_deref().unwrap_or_default()));
        project.origin_link = Some(url.clone());
        checkout_into_fresh_dir(&self.layout, &self.remote, project, &url)
    }
}

/// Subversion repositories.
#[derive(Debug, Clone)]
pub struct SubversionAcquirer<R = SvnRemote>
where
    R: VcsRemote,
{
    layout: StorageLayout,
    remote: R,
}

impl<R> SubversionAcquirer<R>
where
    R: VcsRemote,
{
    pub fn new(layout: StorageLayout, remote: R) -> Self {
        Self { layout, remote }
    }
}

impl<R> Acquire for SubversionAcquirer<R>
where
    R: VcsRemote,
{
    fn origin_type(&self) -> OriginType {
        OriginType::Subversion
    }

    fn claims(&self, project: &Project) -> bool {
        let Some(link) = project.origin_link.as_deref() else {
            return false;
        };

        let url = normalize_link(link);
        match self.remote.probe(&url) {
            Ok(()) => true,
            Err(error) => {
                debug!("{url} is not a subversion remote: {error}");
                false
            }
        }
    }

    fn acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let url = normalize_link(project.origin_link.as_deref().unwrap_or_default());
        project.origin_link = Some(url.clone());
        checkout_into_fresh_dir(&self.layout, &self.remote, project, &url)
    }
}

fn checkout_into_fresh_dir(
    layout: &StorageLayout,
    remote: &impl VcsRemote,
    project: &Project,
    url: &str,
) -> Result<PathBuf> {
    let folder = layout.fresh_cache_dir(project)?;
    match remote.checkout(url, &folder) {
        Ok(()) => Ok(folder),
        Err(error) => {
            if let Err(cleanup) = remove_dir_all(&folder) {
                warn!("failed to remove {:?}: {cleanup}", folder.display());
            }
            Err(error)
        }
    }
}
