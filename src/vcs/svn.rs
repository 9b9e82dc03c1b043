// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Subversion working copies.
//!
//! Subversion mirrors are plain working copies driven through the `svn`
//! command-line client. Every call runs with `--non-interactive`, so a
//! remote asking for credentials fails fast instead of hanging a worker.
//!
//! Refreshing a working copy is a one-rung ladder: update, and if the
//! working copy was left locked by an interrupted operation, clean it up and
//! update once more.

use super::syscall_non_interactive;

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{info, instrument, warn};

/// Layer of indirection for Subversion working copy primitives.
pub trait SvnWorkingCopy {
    /// Bring working copy up to the latest revision.
    fn update(&self) -> Result<String>;

    /// Release stale locks left by an interrupted operation.
    fn cleanup(&self) -> Result<()>;
}

/// Refresh working copy, cleaning up once if it is locked.
///
/// # Errors
///
/// - Return [`SvnError`] if the update fails for any other reason, or fails
///   again after cleanup.
#[instrument(skip(working_copy), level = "debug")]
pub fn refresh_working_copy<W>(working_copy: &W) -> Result<String>
where
    W: SvnWorkingCopy + ?Sized,
{
    match working_copy.update() {
        Ok(summary) => Ok(summary),
        Err(error) if error.to_string().to_ascii_uppercase().contains("LOCKED") => {
            warn!("working copy is locked, cleaning up: {error}");
            working_copy.cleanup()?;
            working_copy.update()
        }
        Err(error) => Err(error),
    }
}

/// Check that target link is a reachable Subversion repository.
///
/// Asks for the log of the latest revision only.
///
/// # Errors
///
/// - Return [`SvnError::Syscall`] if the remote cannot be reached, or is
///   not a Subversion repository.
#[instrument(skip(url, timeout), level = "debug")]
pub fn probe_remote(url: &str, timeout: Duration) -> Result<()> {
    let output = svn(timeout, ["log", "-r", "HEAD", "-l", "1", "-q", url])?;
    if output.trim().is_empty() {
        return Err(SvnError::EmptyLog(url.to_string()));
    }

    Ok(())
}

/// Check out latest revision of remote into target path.
///
/// # Errors
///
/// - Return [`SvnError::Syscall`] if the checkout fails.
#[instrument(skip(url, path, timeout), level = "debug")]
pub fn checkout(url: &str, path: impl AsRef<Path>, timeout: Duration) -> Result<SvnCliWorkingCopy> {
    let path = path.as_ref();
    svn(
        timeout,
        [
            OsString::from("checkout"),
            OsString::from(url),
            path.as_os_str().to_os_string(),
        ],
    )?;
    info!("checked out {url} into {:?}", path.display());

    Ok(SvnCliWorkingCopy::open(path, timeout))
}

/// Working copy driven through the `svn` client.
#[derive(Debug, Clone)]
pub struct SvnCliWorkingCopy {
    path: PathBuf,
    timeout: Duration,
}

impl SvnCliWorkingCopy {
    /// Refer to existing working copy at target path.
    pub fn open(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl SvnWorkingCopy for SvnCliWorkingCopy {
    #[instrument(skip(self), fields(path = ?self.path), level = "debug")]
    fn update(&self) -> Result<String> {
        let output = svn(
            self.timeout,
            [OsString::from("update"), self.path.as_os_str().to_os_string()],
        )?;
        Ok(output
            .lines()
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| "Update successful.".into()))
    }

    #[instrument(skip(self), fields(path = ?self.path), level = "debug")]
    fn cleanup(&self) -> Result<()> {
        svn(
            self.timeout,
            [OsString::from("cleanup"), self.path.as_os_str().to_os_string()],
        )?;
        Ok(())
    }
}

fn svn_args(
    timeout: Duration,
    args: impl IntoIterator<Item = impl Into<OsString>>,
) -> Vec<OsString> {
    let mut full: Vec<OsString> = vec![
        "--non-interactive".into(),
        "--config-option".into(),
        format!("servers:global:http-timeout={}", timeout.as_secs().max(1)).into(),
    ];
    full.extend(args.into_iter().map(Into::into));
    full
}

fn svn(timeout: Duration, args: impl IntoIterator<Item = impl Into<OsString>>) -> Result<String> {
    Ok(syscall_non_interactive("svn", svn_args(timeout, args))?)
}

/// Subversion working copy error types.
#[derive(Debug, thiserror::Error)]
pub enum SvnError {
    /// The `svn` client failed or could not be spawned.
    #[error(transparent)]
    Syscall(#[from] std::io::Error),

    /// Remote answered, but has no history.
    #[error("no log entries found at {0}")]
    EmptyLog(String),
}

/// Friendly result alias :3
pub type Result<T, E = SvnError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    struct ScriptedWorkingCopy {
        updates: RefCell<Vec<Result<String>>>,
        calls: RefCell<Vec<&'static str>>,
    }

    impl ScriptedWorkingCopy {
        fn with_updates(mut updates: Vec<Result<String>>) -> Self {
            updates.reverse();
            Self {
                updates: RefCell::new(updates),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl SvnWorkingCopy for ScriptedWorkingCopy {
        fn update(&self) -> Result<String> {
            self.calls.borrow_mut().push("update");
            self.updates
                .borrow_mut()
                .pop()
                .unwrap_or_else(|| Ok("At revision 1.".into()))
        }

        fn cleanup(&self) -> Result<()> {
            self.calls.borrow_mut().push("cleanup");
            Ok(())
        }
    }

    fn failure(message: &str) -> SvnError {
        SvnError::Syscall(std::io::Error::other(message.to_string()))
    }

    #[test]
    fn locked_working_copy_is_cleaned_up_once() -> anyhow::Result<()> {
        let working_copy = ScriptedWorkingCopy::with_updates(vec![
            Err(failure("svn: E155004: Working copy '/srv/a' locked.")),
            Ok("Updated to revision 42.".into()),
        ]);

        assert_eq!(refresh_working_copy(&working_copy)?, "Updated to revision 42.");
        assert_eq!(*working_copy.calls.borrow(), vec!["update", "cleanup", "update"]);

        Ok(())
    }

    #[test]
    fn other_failures_are_not_retried() {
        let working_copy = ScriptedWorkingCopy::with_updates(vec![Err(failure(
            "svn: E170013: Unable to connect to a repository",
        ))]);

        assert!(refresh_working_copy(&working_copy).is_err());
        assert_eq!(*working_copy.calls.borrow(), vec!["update"]);
    }

    #[test]
    fn every_call_is_non_interactive_with_timeout() {
        let result = svn_args(Duration::from_secs(10), ["update", "/srv/a"]);
        let expect: Vec<OsString> = vec![
            "--non-interactive".into(),
            "--config-option".into(),
            "servers:global:http-timeout=10".into(),
            "update".into(),
            "/srv/a".into(),
        ];
        assert_eq!(result, expect);
    }

    #[test]
    fn unreachable_remote_is_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let url = format!("file://{}", dir.path().display());
        assert!(probe_remote(&url, Duration::from_secs(1)).is_err());
        Ok(())
    }
}
