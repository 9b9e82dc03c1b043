// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tagged release downloads.
//!
//! A __tagged release__ link points at one named release of a hosted
//! repository, e.g., `https://github.com/owner/repo/releases/tag/v1.0`.
//! Instead of mirroring the whole repository, the source tarball of that tag
//! is downloaded and extracted like an uploaded archive.

use crate::config::Settings;

use regex::Regex;
use std::{
    fs::{create_dir_all, File},
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use tracing::{info, instrument};
use url::Url;

const GITHUB_API_REPOS: &str = "https://api.github.com/repos/";

static TAG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"github[.]com.*/releases/tag/(.*)").expect("tag pattern is valid")
});

/// Extract release tag out of link.
pub fn tag_from_link(link: &str) -> Option<String> {
    TAG_PATTERN
        .captures(link)
        .and_then(|captures| captures.get(1))
        .map(|tag| tag.as_str().to_string())
        .filter(|tag| !tag.is_empty())
}

/// Link points at a tagged release.
pub fn is_tagged_release(link: &str) -> bool {
    tag_from_link(link).is_some()
}

/// Extract `owner/repo` out of link whose host is the hosting platform.
pub fn repo_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link.trim()).ok()?;
    if !url.host_str()?.contains("github.com") {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|segment| !segment.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?;
    Some(format!("{owner}/{repo}"))
}

/// Resolve tarball download URL of tagged release link.
pub fn tag_download_url(link: &str) -> Option<String> {
    let repo = repo_from_link(link)?;
    let tag = tag_from_link(link)?;
    Some(format!("{GITHUB_API_REPOS}{repo}/tarball/tags/{tag}"))
}

/// Layer of indirection for release downloads.
pub trait ReleaseFetcher: Send + Sync {
    /// Download release archive at URL into destination file.
    ///
    /// Returns number of bytes written.
    fn fetch(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// Release downloads over HTTP.
#[derive(Debug, Clone)]
pub struct HttpReleaseFetcher {
    timeout: Duration,
    user: Option<String>,
    api_key: Option<String>,
}

impl HttpReleaseFetcher {
    /// Construct anonymous fetcher with target timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            user: None,
            api_key: None,
        }
    }

    /// Authenticate downloads with basic credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, api_key: Option<String>) -> Self {
        self.user = Some(user.into());
        self.api_key = api_key;
        self
    }

    /// Construct fetcher out of configured timeout and credentials.
    pub fn from_settings(settings: &Settings) -> Self {
        let fetcher = Self::new(settings.network.download_timeout());
        match &settings.github.user {
            Some(user) => fetcher.with_credentials(user, settings.github.api_key.clone()),
            None => fetcher,
        }
    }
}

impl ReleaseFetcher for HttpReleaseFetcher {
    #[instrument(skip(self, destination), level = "debug")]
    fn fetch(&self, url: &str, destination: &Path) -> Result<u64> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("archivist/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut request = client.get(url);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.api_key.as_deref());
        }
        let mut response = request.send()?.error_for_status()?;

        let write_err = |err| ReleaseError::Write {
            source: err,
            path: destination.to_path_buf(),
        };
        if let Some(parent) = destination.parent() {
            create_dir_all(parent).map_err(write_err)?;
        }
        let mut file = File::create(destination).map_err(write_err)?;
        let size = response.copy_to(&mut file)?;
        info!("downloaded {size} bytes from {url}");

        Ok(size)
    }
}

/// Release download error types.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// Request failed, timed out, or was answered with a failure status.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Downloaded archive cannot be stored.
    #[error("failed to write release archive {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = ReleaseError> = std::result::Result<T, E>;
