// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git mirrors.
//!
//! A git mirror is a full clone of a remote repository whose working tree
//! follows the remote's default branch. Refreshing a mirror is a __retry
//! ladder__ over three primitives, see [`refresh_mirror`]:
//!
//! 1. If the working tree is dirty, hard reset it to origin's HEAD.
//! 2. Pull the remote default branch.
//! 3. If the pull left the repository mid-merge, reset and pull once more.
//!    If the ref being pulled is no longer advertised by the remote, reset,
//!    recreate the tracking branch, and pull once more. Anything else fails
//!    the refresh.
//!
//! # Stale Locks
//!
//! A crashed writer can leave `index.lock` behind, which would fail every
//! later refresh. Whenever a primitive fails on a lock, the lock file is
//! removed so the next pass can proceed. This can mask two writers working
//! on the same mirror at once, so callers must never share a mirror between
//! concurrent refreshes.
//!
//! # Remote Listings
//!
//! Advertised references are listed through `git ls-remote` rather than
//! libgit2, which cannot list a remote that advertises nothing at all.

use super::syscall_non_interactive;

use auth_git2::GitAuthenticator;
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    opts, AutotagOption, BranchType, Config, ErrorCode, FetchOptions, FetchPrune, Oid,
    RemoteCallbacks, Repository, RepositoryState, ResetType, Signature, StatusOptions,
};
use std::{
    collections::HashSet,
    ffi::OsString,
    fs::remove_file,
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Branches probed for origin's HEAD when the remote does not say.
const PROBE_BRANCHES: [&str; 2] = ["master", "main"];

/// Read timeout in seconds handed to the `git` client, zero for none.
static CLIENT_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(0);

/// Layer of indirection for git mirror primitives.
pub trait GitMirror {
    /// Working tree has no modified, staged, or untracked files.
    fn is_clean(&self) -> Result<bool>;

    /// Pull remote default branch into its local tracking branch.
    ///
    /// Returns a short summary of what changed.
    fn pull(&self) -> Result<String>;

    /// Fetch with pruning, and hard reset to origin's HEAD.
    fn reset(&self) -> Result<()>;

    /// Recreate local tracking branch of remote default branch, and switch
    /// to it.
    fn checkout(&self) -> Result<()>;
}

/// How a failed pull should be escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Give up for this pass.
    Propagate,

    /// Reset, then pull again.
    Reset,

    /// Reset, recreate tracking branch, then pull again.
    ResetAndCheckout,
}

impl Escalation {
    /// Classify failed pull by its error text, ignoring ASCII case.
    pub fn classify(message: &str) -> Self {
        let message = message.trim().to_ascii_uppercase();
        if message.ends_with("MERGING") {
            Self::Reset
        } else if message.starts_with("REMOTE DID NOT ADVERTISE REF")
            || message.starts_with("REMOTE ORIGIN DID NOT ADVERTISE REF")
        {
            Self::ResetAndCheckout
        } else {
            Self::Propagate
        }
    }
}

/// Refresh git mirror through the retry ladder.
///
/// Returns the summary of the last successful pull.
///
/// # Errors
///
/// - Return [`GitError`] of the first primitive that fails outside of the
///   escalation rules, or of the single retried pull.
#[instrument(skip(mirror), level = "debug")]
pub fn refresh_mirror<M>(mirror: &M) -> Result<String>
where
    M: GitMirror + ?Sized,
{
    if !mirror.is_clean()? {
        info!("working tree is dirty, resetting before pull");
        mirror.reset()?;
    }

    let error = match mirror.pull() {
        Ok(summary) => return Ok(summary),
        Err(error) => error,
    };

    match Escalation::classify(&error.to_string()) {
        Escalation::Propagate => Err(error),
        Escalation::Reset => {
            warn!("pull failed mid-merge, resetting: {error}");
            mirror.reset()?;
            mirror.pull()
        }
        Escalation::ResetAndCheckout => {
            warn!("upstream branch moved, resetting and checking out: {error}");
            mirror.reset()?;
            mirror.checkout()?;
            mirror.pull()
        }
    }
}

/// Apply connect and read timeouts to every git transport.
///
/// Covers both libgit2 and the `git` client used to list remote references.
///
/// # Errors
///
/// - Return [`GitError::Git2`] if libgit2 rejects the options.
pub fn configure_timeouts(timeout: Duration) -> Result<()> {
    let timeout_ms = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;

    // SAFETY: Called before any transport is in use.
    unsafe {
        opts::set_server_connect_timeout_in_milliseconds(timeout_ms)?;
        opts::set_server_timeout_in_milliseconds(timeout_ms)?;
    }
    CLIENT_TIMEOUT_SECS.store(timeout.as_secs().max(1), Ordering::Relaxed);

    Ok(())
}

/// Check that target link is a reachable git remote.
///
/// Lists the remote's advertised references through `git ls-remote` without
/// downloading anything. A remote advertising no references at all, e.g., a
/// freshly created repository, is still a git remote.
///
/// # Errors
///
/// - Return [`GitError::Syscall`] if the remote cannot be reached, or does
///   not speak git.
#[instrument(skip(url), level = "debug")]
pub fn probe_remote(url: &str) -> Result<()> {
    let listing = ls_remote(None, url)?;
    debug!("remote {url} advertised {} refs", listing.advertised.len());

    Ok(())
}

/// Clone every branch of remote into target path.
///
/// # Errors
///
/// - Return [`GitError::Git2`] if the clone fails.
#[instrument(skip(url, path), level = "debug")]
pub fn clone_mirror(url: &str, path: impl AsRef<Path>) -> Result<Git2Mirror> {
    let authenticator = authenticator();
    let config = default_config()?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(authenticator.credentials(&config));

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options.download_tags(AutotagOption::All);
    let repository = RepoBuilder::new()
        .fetch_options(options)
        .clone(url, path.as_ref())?;
    info!("cloned {url} into {:?}", path.as_ref().display());

    Ok(Git2Mirror {
        repository,
        authenticator,
    })
}

/// Git mirror driven through libgit2.
pub struct Git2Mirror {
    repository: Repository,
    authenticator: GitAuthenticator,
}

impl Git2Mirror {
    /// Open existing mirror at target path.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Git2`] if no repository exists at the path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            repository: Repository::open(path.as_ref())?,
            authenticator: authenticator(),
        })
    }

    /// Path to working tree of mirror.
    pub fn path(&self) -> &Path {
        self.repository
            .workdir()
            .unwrap_or_else(|| self.repository.path())
    }

    fn callbacks<'cb>(&'cb self, config: &'cb Config) -> RemoteCallbacks<'cb> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(self.authenticator.credentials(config));
        callbacks
    }

    fn list_remote(&self) -> Result<RemoteListing> {
        ls_remote(Some(self.path()), "origin")
    }

    fn fetch(&self, prune: bool) -> Result<()> {
        let config = self.repository.config()?;
        let mut remote = self.repository.find_remote("origin")?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks(&config));
        options.download_tags(AutotagOption::All);

        // INVARIANT: Empty refspec list means the remote's configured refspecs.
        let refspecs: &[&str] = if prune {
            options.prune(FetchPrune::On);
            &["+refs/heads/*:refs/remotes/origin/*"]
        } else {
            &[]
        };
        remote.fetch(refspecs, Some(&mut options), None)?;

        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        let head = self.repository.head()?;
        match head.name() {
            Some(name) if head.is_branch() => Ok(name.to_string()),
            _ => Err(GitError::Detached),
        }
    }

    fn fallback_branch(&self) -> Result<String> {
        PROBE_BRANCHES
            .iter()
            .find(|name| {
                self.repository
                    .find_branch(&format!("origin/{name}"), BranchType::Remote)
                    .is_ok()
            })
            .map(|name| format!("refs/heads/{name}"))
            .ok_or(GitError::NoOriginHead)
    }

    fn origin_head(&self, listing: Option<&RemoteListing>) -> Result<Oid> {
        if let Some(oid) = listing.and_then(|listing| listing.head) {
            if self.repository.find_commit(oid).is_ok() {
                return Ok(oid);
            }
        }

        for name in PROBE_BRANCHES {
            let branch = self
                .repository
                .find_branch(&format!("origin/{name}"), BranchType::Remote);
            if let Ok(branch) = branch {
                return Ok(branch.get().peel_to_commit()?.id());
            }
        }

        // INVARIANT: Last resort is any remote tracking ref literally named HEAD.
        for reference in self.repository.references_glob("refs/remotes/*")? {
            let reference = reference?;
            if reference.name().is_some_and(|name| name.ends_with("/HEAD")) {
                return Ok(reference.resolve()?.peel_to_commit()?.id());
            }
        }

        Err(GitError::NoOriginHead)
    }

    fn track(&self, branch: &str, force: bool) -> Result<()> {
        let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        let refname = format!("refs/heads/{short}");
        let upstream_name = format!("origin/{short}");
        let upstream = self
            .repository
            .find_branch(&upstream_name, BranchType::Remote)?;
        let target = upstream.get().peel_to_commit()?;

        let exists = self.repository.find_branch(short, BranchType::Local).is_ok();
        if !exists || force {
            self.repository.reference(
                &refname,
                target.id(),
                true,
                &format!("archivist: track {upstream_name}"),
            )?;
        }
        let mut local = self.repository.find_branch(short, BranchType::Local)?;
        local.set_upstream(Some(&upstream_name))?;

        let current = self
            .repository
            .head()
            .ok()
            .and_then(|head| head.name().map(ToString::to_string));
        if current.as_deref() != Some(refname.as_str()) || force {
            let commit = local.get().peel_to_commit()?;
            let mut builder = CheckoutBuilder::new();
            if force {
                builder.force();
            } else {
                builder.safe();
            }
            self.repository
                .checkout_tree(commit.as_object(), Some(&mut builder))?;
            self.repository.set_head(&refname)?;
            debug!("switched to {refname}");
        }

        Ok(())
    }

    fn merge_upstream(&self, branch: &str) -> Result<String> {
        let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        let upstream = self
            .repository
            .find_reference(&format!("refs/remotes/origin/{short}"))?;
        let incoming = self.repository.reference_to_annotated_commit(&upstream)?;
        let (analysis, _) = self.repository.merge_analysis(&[&incoming])?;

        if analysis.is_up_to_date() {
            return Ok(format!("{short} already up to date"));
        }

        if analysis.is_fast_forward() {
            let mut local = self.repository.find_reference(branch)?;
            local.set_target(incoming.id(), "archivist: fast-forward")?;
            self.repository.set_head(branch)?;
            self.repository
                .checkout_head(Some(CheckoutBuilder::new().force()))?;
            return Ok(format!("fast-forwarded {short} to {}", incoming.id()));
        }

        self.repository.merge(&[&incoming], None, None)?;
        let mut index = self.repository.index()?;
        if index.has_conflicts() {
            return Err(GitError::Conflicts(format!("origin/{short}")));
        }

        let signature = self
            .repository
            .signature()
            .or_else(|_| Signature::now("archivist", "archivist@localhost"))?;
        let tree = self.repository.find_tree(index.write_tree()?)?;
        let ours = self.repository.head()?.peel_to_commit()?;
        let theirs = self.repository.find_commit(incoming.id())?;
        self.repository.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Merge origin/{short} into {short}"),
            &tree,
            &[&ours, &theirs],
        )?;
        self.repository.cleanup_state()?;

        Ok(format!("merged origin/{short} into {short}"))
    }

    fn try_pull(&self) -> Result<String> {
        if self.repository.state() == RepositoryState::Merge {
            return Err(GitError::Merging);
        }

        let listing = self.list_remote()?;
        let branch = match listing.default_branch.clone() {
            Some(branch) => branch,
            None => self.current_branch()?,
        };
        if !listing.advertised.contains(&branch) {
            return Err(GitError::NotAdvertised(branch));
        }

        self.fetch(false)?;
        self.track(&branch, false)?;
        self.merge_upstream(&branch)
    }

    fn try_reset(&self) -> Result<()> {
        let listing = match self.list_remote() {
            Ok(listing) => Some(listing),
            Err(error) => {
                debug!("cannot list remote, probing branches instead: {error}");
                None
            }
        };

        self.fetch(true)?;
        let oid = self.origin_head(listing.as_ref())?;
        let commit = self.repository.find_commit(oid)?;
        self.repository.reset(
            commit.as_object(),
            ResetType::Hard,
            Some(CheckoutBuilder::new().force()),
        )?;
        self.repository.cleanup_state()?;
        info!("reset {:?} to {oid}", self.path().display());

        Ok(())
    }

    fn try_checkout(&self) -> Result<()> {
        let branch = match self.list_remote()?.default_branch {
            Some(branch) => branch,
            None => self.fallback_branch()?,
        };
        self.track(&branch, true)
    }

    fn clear_stale_lock<T>(&self, result: Result<T>) -> Result<T> {
        let locked = match &result {
            Err(GitError::Git2(error)) => {
                error.code() == ErrorCode::Locked || error.message().contains("index.lock")
            }
            _ => false,
        };

        if locked {
            let lock = self.repository.path().join("index.lock");
            match remove_file(&lock) {
                Ok(()) => warn!("removed stale lock {:?}", lock.display()),
                Err(error) => warn!("failed to remove stale lock {:?}: {error}", lock.display()),
            }
        }

        result
    }
}

impl GitMirror for Git2Mirror {
    fn is_clean(&self) -> Result<bool> {
        let mut options = StatusOptions::new();
        options.include_untracked(true).include_ignored(false);
        let statuses = self.repository.statuses(Some(&mut options))?;
        Ok(statuses.is_empty())
    }

    #[instrument(skip(self), fields(path = ?self.path()), level = "debug")]
    fn pull(&self) -> Result<String> {
        self.clear_stale_lock(self.try_pull())
    }

    #[instrument(skip(self), fields(path = ?self.path()), level = "debug")]
    fn reset(&self) -> Result<()> {
        self.clear_stale_lock(self.try_reset())
    }

    #[instrument(skip(self), fields(path = ?self.path()), level = "debug")]
    fn checkout(&self) -> Result<()> {
        self.clear_stale_lock(self.try_checkout())
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct RemoteListing {
    default_branch: Option<String>,
    head: Option<Oid>,
    advertised: HashSet<String>,
}

impl RemoteListing {
    /// Parse output of `git ls-remote --symref`.
    ///
    /// Lines that are neither a symbolic ref nor an object id paired with a
    /// ref name are ignored, so warnings mixed into the output are harmless.
    fn parse(output: &str) -> Self {
        let mut listing = Self::default();
        for line in output.lines() {
            let Some((left, name)) = line.trim_end().split_once('\t') else {
                continue;
            };

            if let Some(target) = left.strip_prefix("ref: ") {
                if name == "HEAD" {
                    listing.default_branch = Some(target.trim().to_string());
                }
                continue;
            }

            let Ok(oid) = Oid::from_str(left.trim()) else {
                continue;
            };
            if name == "HEAD" {
                listing.head = Some(oid);
            }
            listing.advertised.insert(name.to_string());
        }

        listing
    }
}

/// List references advertised by remote through the `git` client.
///
/// Runs inside `workdir` when given, so `remote` may name a configured
/// remote instead of a link.
fn ls_remote(workdir: Option<&Path>, remote: &str) -> Result<RemoteListing> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(workdir) = workdir {
        args.push("-C".into());
        args.push(workdir.as_os_str().to_os_string());
    }

    let timeout = CLIENT_TIMEOUT_SECS.load(Ordering::Relaxed);
    if timeout > 0 {
        args.push("-c".into());
        args.push("http.lowSpeedLimit=1".into());
        args.push("-c".into());
        args.push(format!("http.lowSpeedTime={timeout}").into());
    }
    args.extend(["ls-remote".into(), "--symref".into(), remote.into()]);

    let output = syscall_non_interactive("git", args)?;
    Ok(RemoteListing::parse(&output))
}

fn authenticator() -> GitAuthenticator {
    // INVARIANT: Never block a background pass on a password prompt.
    GitAuthenticator::default().try_password_prompt(0)
}

fn default_config() -> Result<Config> {
    Ok(Config::open_default().or_else(|_| Config::new())?)
}

/// Git mirror error types.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// A previous merge was never concluded.
    #[error("cannot pull into a repository with state: MERGING")]
    Merging,

    /// Pull left conflicts behind.
    #[error("merge of {0} has conflicts, repository state: MERGING")]
    Conflicts(String),

    /// Branch being pulled is gone from the remote.
    #[error("remote did not advertise ref {0}")]
    NotAdvertised(String),

    /// No candidate for origin's HEAD could be found.
    #[error("cannot resolve HEAD of origin")]
    NoOriginHead,

    /// HEAD is not on a branch.
    #[error("repository HEAD is not on a branch")]
    Detached,

    /// The `git` client failed or could not be spawned.
    #[error(transparent)]
    Syscall(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = GitError> = std::result::Result<T, E>;
