// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Maintenance passes over cached mirrors.
//!
//! Completed Git and Subversion projects are refreshed against their
//! upstream on a schedule. Each origin type has its own [`Synchronize`]
//! implementation that owns its escalation ladder. The [`MaintenanceJob`]
//! only picks the right one and records what happened on the project's
//! maintenance status, leaving its acquisition status alone.
//!
//! # See Also
//!
//! - [`crate::schedule::Scheduler`]

use crate::{
    config::Settings,
    project::{OriginType, Project, ProjectId, Status},
    schedule::BatchJob,
    store::{self, ProjectStore},
    vcs::{
        git::{refresh_mirror, Git2Mirror, GitError},
        svn::{refresh_working_copy, SvnCliWorkingCopy, SvnError},
    },
};

use chrono::Utc;
use std::{path::Path, time::Duration};
use tracing::{info, instrument, warn};

/// Layer of indirection for refreshing one kind of mirror.
pub trait Synchronize: Send + Sync {
    /// Origin type this synchronizer refreshes.
    fn origin_type(&self) -> OriginType;

    /// Refresh mirror at target cache folder.
    ///
    /// Returns a short summary of what changed.
    fn synchronize(&self, cache_folder: &Path) -> Result<String>;
}

/// Git mirrors driven through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitSync;

impl Synchronize for GitSync {
    fn origin_type(&self) -> OriginType {
        OriginType::Git
    }

    fn synchronize(&self, cache_folder: &Path) -> Result<String> {
        let mirror = Git2Mirror::open(cache_folder)?;
        Ok(refresh_mirror(&mirror)?)
    }
}

/// Subversion working copies driven through the `svn` client.
#[derive(Debug, Clone, Copy)]
pub struct SvnSync {
    timeout: Duration,
}

impl SvnSync {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Synchronize for SvnSync {
    fn origin_type(&self) -> OriginType {
        OriginType::Subversion
    }

    fn synchronize(&self, cache_folder: &Path) -> Result<String> {
        let working_copy = SvnCliWorkingCopy::open(cache_folder, self.timeout);
        Ok(refresh_working_copy(&working_copy)?)
    }
}

/// Batch job refreshing every completed mirror.
pub struct MaintenanceJob {
    synchronizers: Vec<Box<dyn Synchronize>>,
}

impl MaintenanceJob {
    pub fn new(synchronizers: Vec<Box<dyn Synchronize>>) -> Self {
        Self { synchronizers }
    }

    /// Construct job with Git and Subversion synchronizers.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(vec![
            Box::new(GitSync),
            Box::new(SvnSync::new(settings.network.probe_timeout())),
        ])
    }

    fn synchronize(&self, project: &Project) -> Result<String> {
        let origin_type = project
            .origin_type()
            .ok_or(MaintainError::NoOriginType(project.id))?;
        let folder = project
            .cache_folder()
            .ok_or(MaintainError::NoCacheFolder(project.id))?;
        let synchronizer = self
            .synchronizers
            .iter()
            .find(|sync| sync.origin_type() == origin_type)
            .ok_or(MaintainError::Unsupported(origin_type))?;

        synchronizer.synchronize(folder)
    }
}

impl BatchJob for MaintenanceJob {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    fn eligible(&self, store: &dyn ProjectStore) -> store::Result<Vec<Project>> {
        let mut projects = store.find_by_type(OriginType::Git, Status::Complete)?;
        projects.extend(store.find_by_type(OriginType::Subversion, Status::Complete)?);
        Ok(projects)
    }

    fn ready(&self, project: &Project) -> bool {
        project.is_maintainable()
    }

    #[instrument(skip(self, store, project), fields(project = %project.id), level = "debug")]
    fn run(&self, store: &dyn ProjectStore, project: Project) {
        let id = project.id;
        let marked = store.update(id, &mut |project: &mut Project| {
            project.maintenance_status = Some(Status::Processing);
        });
        match marked {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("project {id} is gone, skipping maintenance");
                return;
            }
            Err(error) => {
                warn!("failed to mark project {id} as in maintenance: {error}");
                return;
            }
        }

        let maintained_at = Utc::now();
        let (status, message) = match self.synchronize(&project) {
            Ok(summary) => {
                info!("project {id} synchronized: {summary}");
                (Status::Complete, summary)
            }
            Err(error) => {
                warn!("sync error on project {id}: {error}");
                (Status::Error, error.to_string())
            }
        };

        // INVARIANT: Only maintenance fields are written back.
        let recorded = store.update(id, &mut |project: &mut Project| {
            project.maintenance_status = Some(status);
            project.maintenance_message = Some(message.clone());
            project.last_maintained_at = Some(maintained_at);
        });
        if let Err(error) = recorded {
            warn!("failed to record maintenance of project {id}: {error}");
        }
    }
}

/// Maintenance error types.
#[derive(Debug, thiserror::Error)]
pub enum MaintainError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Svn(#[from] SvnError),

    #[error("project {0} has no origin type")]
    NoOriginType(ProjectId),

    #[error("project {0} has no cache folder")]
    NoCacheFolder(ProjectId),

    /// No synchronizer handles this origin type.
    #[error("Unknown Repository Type: {0}")]
    Unsupported(OriginType),
}

/// Friendly result alias :3
pub type Result<T, E = MaintainError> = std::result::Result<T, E>;
