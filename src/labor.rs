// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Labor hour estimates.
//!
//! The labor hours that went into a cached project are estimated from its
//! source in three stages:
//!
//! 1. Count source lines with a line-counting tool (`cloc --json`).
//! 2. Post the line count to an effort model, and scrape the effort in
//!    person-months out of its answer.
//! 3. Convert person-months into hours at 152 hours per month.
//!
//! A stage that fails is logged and treated as zero, so an estimate is
//! always recorded. Mirrors are re-estimated after each maintenance pass,
//! while archives are estimated once.

use crate::{
    config::Settings,
    project::{LaborEstimate, OriginType, Project, ProjectId, Status},
    schedule::BatchJob,
    store::{self, ProjectStore},
};

use chrono::Utc;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Working hours in one person-month.
pub const HOURS_PER_MONTH: f64 = 152.0;

static EFFORT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Effort = ([\d\.]+) Person-months").expect("effort pattern is valid")
});

/// Layer of indirection for labor estimation.
pub trait LaborEstimator: Send + Sync {
    /// Estimate labor that went into source under target folder.
    fn estimate(&self, cache_folder: &Path) -> LaborEstimate;
}

/// Estimator backed by `cloc` and a remote effort model.
#[derive(Debug, Clone)]
pub struct ClocEstimator {
    cloc: Option<PathBuf>,
    effort_url: Option<String>,
    timeout: Duration,
}

impl ClocEstimator {
    pub fn new(cloc: Option<PathBuf>, effort_url: Option<String>, timeout: Duration) -> Self {
        Self {
            cloc,
            effort_url,
            timeout,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.labor.cloc.clone(),
            settings.labor.effort_url.clone(),
            settings.network.download_timeout(),
        )
    }

    /// Run line-counting tool over target folder.
    ///
    /// # Errors
    ///
    /// - Return [`LaborError::NoTool`] if no tool is configured.
    /// - Return [`LaborError::Cloc`] if the tool cannot be run or fails.
    #[instrument(skip(self), level = "debug")]
    pub fn count_lines(&self, folder: &Path) -> Result<String> {
        let cloc = self.cloc.as_ref().ok_or(LaborError::NoTool)?;
        let output = Command::new(cloc)
            .arg("--json")
            .arg(folder)
            .output()
            .map_err(LaborError::Cloc)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LaborError::Cloc(std::io::Error::other(format!(
                "{:?} exited with {}: {}",
                cloc.display(),
                output.status,
                stderr.trim()
            ))));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Ask effort model for effort in person-months of target line count.
    ///
    /// # Errors
    ///
    /// - Return [`LaborError::NoEffortModel`] if no model is configured.
    /// - Return [`LaborError::Http`] if the model cannot be reached, or
    ///   answers with a failure status.
    /// - Return [`LaborError::NoEffort`] if the answer carries no effort.
    #[instrument(skip(self), level = "debug")]
    pub fn effort(&self, sloc: u64) -> Result<f64> {
        let url = self.effort_url.as_deref().ok_or(LaborError::NoEffortModel)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("archivist/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let body = client
            .post(url)
            .form(&[("new_size", sloc.to_string())])
            .send()?
            .error_for_status()?
            .text()?;

        scrape_effort(&body).ok_or(LaborError::NoEffort)
    }
}

impl LaborEstimator for ClocEstimator {
    fn estimate(&self, cache_folder: &Path) -> LaborEstimate {
        let report = self
            .count_lines(cache_folder)
            .inspect_err(|error| warn!("line count of {:?} failed: {error}", cache_folder.display()))
            .ok();

        let sloc = report
            .as_deref()
            .map(sloc_from_report)
            .transpose()
            .inspect_err(|error| warn!("line count report is unusable: {error}"))
            .ok()
            .flatten()
            .unwrap_or(0);

        let effort = if sloc > 0 {
            self.effort(sloc)
                .inspect_err(|error| warn!("effort lookup for {sloc} lines failed: {error}"))
                .unwrap_or(0.0)
        } else {
            0.0
        };

        LaborEstimate {
            report,
            sloc,
            effort,
            hours: labor_hours(effort),
        }
    }
}

/// Read total lines of code out of `cloc --json` report.
///
/// # Errors
///
/// - Return [`LaborError::Report`] if the report is not JSON.
/// - Return [`LaborError::MissingSum`] if the report has no code total.
pub fn sloc_from_report(report: &str) -> Result<u64> {
    let report: serde_json::Value = serde_json::from_str(report)?;
    report
        .pointer("/SUM/code")
        .and_then(serde_json::Value::as_u64)
        .ok_or(LaborError::MissingSum)
}

/// Scrape effort in person-months out of effort model answer.
pub fn scrape_effort(body: &str) -> Option<f64> {
    EFFORT_PATTERN
        .captures(body)
        .and_then(|captures| captures.get(1))
        .and_then(|effort| effort.as_str().parse().ok())
}

/// Convert person-months into hours, rounded to one decimal.
pub fn labor_hours(effort: f64) -> f64 {
    (effort * HOURS_PER_MONTH * 10.0).round() / 10.0
}

/// Project has never been estimated, or changed since its last estimate.
pub fn needs_estimate(project: &Project) -> bool {
    match project.origin_type() {
        Some(OriginType::Git | OriginType::Subversion) => {
            project.last_maintained_at.is_some_and(|maintained| {
                project
                    .labor_calculated_at
                    .is_none_or(|calculated| calculated < maintained)
            })
        }
        Some(OriginType::File | OriginType::TaggedRelease) => project.labor_calculated_at.is_none(),
        Some(OriginType::Container) | None => false,
    }
}

/// Batch job estimating labor hours of cached projects.
pub struct LaborHoursJob<E = ClocEstimator>
where
    E: LaborEstimator,
{
    estimator: E,
}

impl<E> LaborHoursJob<E>
where
    E: LaborEstimator,
{
    pub fn new(estimator: E) -> Self {
        Self { estimator }
    }
}

impl<E> BatchJob for LaborHoursJob<E>
where
    E: LaborEstimator + 'static,
{
    fn name(&self) -> &'static str {
        "labor hours"
    }

    fn eligible(&self, store: &dyn ProjectStore) -> store::Result<Vec<Project>> {
        let projects = store.find_by_status(Status::Complete)?;
        Ok(projects.into_iter().filter(needs_estimate).collect())
    }

    fn ready(&self, project: &Project) -> bool {
        project.status == Status::Complete && needs_estimate(project)
    }

    #[instrument(skip(self, store, project), fields(project = %project.id), level = "debug")]
    fn run(&self, store: &dyn ProjectStore, project: Project) {
        let id = project.id;
        let marked = store.update(id, &mut |project: &mut Project| {
            project.labor_status = Some(Status::Processing);
        });
        match marked {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("project {id} is gone, skipping labor hours");
                return;
            }
            Err(error) => {
                warn!("failed to mark project {id} for labor hours: {error}");
                return;
            }
        }

        let (status, estimate) = match project.cache_folder() {
            Some(folder) => {
                let estimate = self.estimator.estimate(folder);
                info!(
                    "project {id} estimated at {} hours over {} lines",
                    estimate.hours, estimate.sloc
                );
                (Status::Complete, Some(estimate))
            }
            None => {
                warn!("{}", LaborError::NoCacheFolder(id));
                (Status::Error, None)
            }
        };
        let calculated_at = Utc::now();

        // INVARIANT: Only labor fields are written back.
        let recorded = store.update(id, &mut |project: &mut Project| {
            if estimate.is_some() {
                project.labor = estimate.clone();
            }
            project.labor_status = Some(status);
            project.labor_calculated_at = Some(calculated_at);
        });
        match recorded {
            Ok(_) => debug!("labor hours of project {id} recorded"),
            Err(error) => warn!("failed to record labor hours of project {id}: {error}"),
        }
    }
}

/// Labor estimation error types.
#[derive(Debug, thiserror::Error)]
pub enum LaborError {
    #[error("no line-counting tool configured")]
    NoTool,

    #[error("line-counting tool failed: {0}")]
    Cloc(#[source] std::io::Error),

    #[error("line count report is not valid JSON: {0}")]
    Report(#[from] serde_json::Error),

    #[error("line count report has no code total")]
    MissingSum,

    #[error("no effort model configured")]
    NoEffortModel,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("effort model answer carries no effort")]
    NoEffort,

    #[error("project {0} has no cache folder to estimate")]
    NoCacheFolder(ProjectId),
}

/// Friendly result alias :3
pub type Result<T, E = LaborError> = std::result::Result<T, E>;
