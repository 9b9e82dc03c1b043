// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Source code archiver.
//!
//! Archivist takes requests to archive software projects, fetches their
//! source once, and keeps it cached on disk. A project can come from a Git or
//! Subversion remote, a tagged release of a hosted repository, an uploaded
//! source archive, or an uploaded container image.
//!
//! Remote mirrors are kept fresh by periodic maintenance passes, and the
//! labor hours that went into each project are estimated from its cached
//! source.
//!
//! # See Also
//!
//! - [`acquire::Dispatcher`]
//! - [`schedule::Scheduler`]
//! - [`maintain::MaintenanceJob`]
//! - [`labor::LaborHoursJob`]

pub mod acquire;
pub mod config;
pub mod extract;
pub mod labor;
pub mod maintain;
pub mod path;
pub mod project;
pub mod release;
pub mod schedule;
pub mod store;
pub mod vcs;
