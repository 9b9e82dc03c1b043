// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Project records.
//!
//! A __project__ is the unit of caching. Each project owns exactly one cache
//! folder under the storage layout, and remembers where its content came from
//! so that the maintenance pass knows how to keep it fresh.
//!
//! # Origin Links
//!
//! Remote origin links are normalized before they are stored or looked up.
//! Normalization forces an `https` scheme and drops any trailing slash or
//! `.git` suffix. Git links are then stored with a `.git` suffix appended,
//! while Subversion links are stored as-is. Two requests whose links
//! normalize to the same value resolve to the same cached project, so the
//! normalized link is effectively a deduplication key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

/// Stable identifier of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ProjectId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        self.0.fmt(fmt)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(data).map(Self)
    }
}

/// Where the cached content of a project came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum OriginType {
    Git,
    Subversion,
    File,
    Container,
    TaggedRelease,
}

impl OriginType {
    /// Origin is a live version control mirror that needs maintenance.
    pub fn is_vcs(&self) -> bool {
        matches!(self, Self::Git | Self::Subversion)
    }
}

impl Display for OriginType {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Git => "Git",
            Self::Subversion => "Subversion",
            Self::File => "File",
            Self::Container => "Container",
            Self::TaggedRelease => "TaggedRelease",
        };
        fmt.write_str(name)
    }
}

/// Lifecycle state shared by acquisition, maintenance, and labor hours.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Status {
    #[default]
    Pending,
    Processing,
    Error,
    Complete,
}

/// Storage partition a project's files live under.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessClass {
    #[default]
    Standard,
    Restricted,
}

/// Labor hour estimate computed from a project's cached source.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
pub struct LaborEstimate {
    /// Raw line-count report, kept for auditing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,

    /// Source lines of code.
    pub sloc: u64,

    /// Effort in person-months.
    pub effort: f64,

    /// Labor hours derived from effort.
    pub hours: f64,
}

/// A cached software project.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Project {
    pub id: ProjectId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    cache_folder: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_type: Option<OriginType>,

    pub status: Status,

    #[serde(default)]
    pub status_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_status: Option<Status>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_maintained_at: Option<DateTime<Utc>>,

    #[serde(default)]
    external_refs: BTreeSet<u64>,

    #[serde(default)]
    pub access_class: AccessClass,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor: Option<LaborEstimate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor_status: Option<Status>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor_calculated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Construct new pending project with a freshly generated identifier.
    pub fn new(access_class: AccessClass) -> Self {
        Self {
            id: ProjectId::generate(),
            origin_link: None,
            uploaded_file: None,
            cache_folder: None,
            origin_type: None,
            status: Status::Pending,
            status_message: String::new(),
            maintenance_status: None,
            maintenance_message: None,
            last_maintained_at: None,
            external_refs: BTreeSet::new(),
            access_class,
            labor: None,
            labor_status: None,
            labor_calculated_at: None,
            added_at: None,
            updated_at: None,
        }
    }

    pub fn origin_type(&self) -> Option<OriginType> {
        self.origin_type
    }

    /// Fix origin type of project.
    ///
    /// Re-assigning the same type is a no-op.
    ///
    /// # Errors
    ///
    /// - Return [`ProjectError::OriginTypeFixed`] if a different type was
    ///   already assigned.
    pub fn assign_origin_type(&mut self, origin_type: OriginType) -> Result<()> {
        match self.origin_type {
            Some(current) if current != origin_type => Err(ProjectError::OriginTypeFixed {
                current,
                requested: origin_type,
            }),
            _ => {
                self.origin_type = Some(origin_type);
                Ok(())
            }
        }
    }

    pub fn cache_folder(&self) -> Option<&Path> {
        self.cache_folder.as_deref()
    }

    /// Record successful acquisition into target cache folder.
    pub fn complete_with(&mut self, cache_folder: impl Into<PathBuf>, message: impl Into<String>) {
        self.cache_folder = Some(cache_folder.into());
        self.status = Status::Complete;
        self.status_message = message.into();
    }

    /// Record failed acquisition.
    ///
    /// The cache folder of a failed attempt is never kept.
    pub fn fail_with(&mut self, message: impl Into<String>) {
        self.cache_folder = None;
        self.status = Status::Error;
        self.status_message = message.into();
    }

    pub fn external_refs(&self) -> impl Iterator<Item = u64> + '_ {
        self.external_refs.iter().copied()
    }

    /// Map external reference onto project.
    ///
    /// Returns false if the reference was already mapped.
    pub fn add_external_ref(&mut self, external_ref: u64) -> bool {
        self.external_refs.insert(external_ref)
    }

    /// Project is a completed version control mirror.
    pub fn is_maintainable(&self) -> bool {
        self.status == Status::Complete && self.origin_type.is_some_and(|kind| kind.is_vcs())
    }
}

/// Normalize raw origin link for storage and lookup.
///
/// Forces `https`, and strips trailing slashes and any `.git` suffix.
pub fn normalize_link(raw: impl AsRef<str>) -> String {
    let trimmed = raw.as_ref().trim();
    let rest = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };

    let mut link = format!("https://{rest}");
    loop {
        if let Some(stripped) = link.strip_suffix('/') {
            link.truncate(stripped.len());
        } else if let Some(stripped) = link.strip_suffix(".git") {
            link.truncate(stripped.len());
        } else {
            break;
        }
    }

    link
}

/// Form git link out of normalized link.
pub fn git_link(normalized: impl AsRef<str>) -> String {
    format!("{}.git", normalized.as_ref())
}

/// All stored forms a raw link can take.
pub fn link_candidates(raw: impl AsRef<str>) -> [String; 2] {
    let normalized = normalize_link(raw);
    let git = git_link(&normalized);
    [normalized, git]
}

/// Project invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectError {
    /// Origin type cannot change once assigned.
    #[error("origin type already fixed as {current}, refusing to change it to {requested}")]
    OriginTypeFixed {
        current: OriginType,
        requested: OriginType,
    },
}

/// Friendly result alias :3
type Result<T, E = ProjectError> = std::result::Result<T, E>;
