// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control mirrors.
//!
//! Projects acquired from a remote repository are kept as live working
//! copies, i.e., __mirrors__, that the maintenance pass refreshes on a
//! schedule. Git mirrors are driven through libgit2, with remote reference
//! listings taken from the `git` client. Subversion mirrors are driven
//! through the `svn` command-line client.
//!
//! Both engines split their work into small primitives behind a trait, and
//! a retry ladder that decides how to escalate when a refresh fails. The
//! ladder only ever looks at error text, so it can be exercised without a
//! real remote.
//!
//! # See Also
//!
//! - [`git::refresh_mirror`]
//! - [`svn::refresh_working_copy`]

pub mod git;
pub mod svn;

use std::{ffi::OsStr, process::Command};
use tracing::debug;

/// Run external command to completion without user interaction.
///
/// Returns collected standard output and standard error with trailing
/// newline chomped.
///
/// # Errors
///
/// - Return [`std::io::Error`] if the command cannot be spawned, or exits
///   with a failure status. The error message carries the collected output.
pub(crate) fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> std::io::Result<String> {
    // INVARIANT: The git client must never prompt on a terminal.
    let output = Command::new(cmd.as_ref())
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(stdout.as_str());
    }

    if !stderr.is_empty() {
        message.push_str(stderr.as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "command {:?} failed: {message}",
            cmd.as_ref()
        )));
    }
    debug!("command {:?} succeeded", cmd.as_ref());

    Ok(message)
}
