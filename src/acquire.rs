// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Project acquisition.
//!
//! Turn an archive request into a cached project. The [`Dispatcher`] owns an
//! ordered list of acquirers, each able to [`Acquire`] one kind of origin.
//! They are consulted in a fixed order, and the first one that claims the
//! project fixes its origin type:
//!
//! 1. [`ContainerAcquirer`] for container image uploads.
//! 2. [`FileAcquirer`] for uploaded archives.
//! 3. [`TaggedReleaseAcquirer`] for tagged release links.
//! 4. [`GitAcquirer`] for links that answer a git reference listing.
//! 5. [`SubversionAcquirer`] for links that answer a Subversion log query.
//!
//! A link no acquirer claims fails with "Unable to determine origin type".
//!
//! # Deduplication
//!
//! Requests are deduplicated by normalized origin link. Requesting a link
//! that is already cached maps the new external reference onto the existing
//! project instead of fetching the link again. Only projects whose previous
//! acquisition failed are acquired anew.

mod archive;
mod mirror;

pub use archive::{ContainerAcquirer, FileAcquirer, TaggedReleaseAcquirer};
pub use mirror::{GitAcquirer, GitRemote, SubversionAcquirer, SvnRemote, VcsRemote};

use crate::{
    config::Settings,
    extract::{detect_file_format, ExtractError},
    path::StorageLayout,
    project::{link_candidates, normalize_link, AccessClass, OriginType, Project, ProjectError, ProjectId, Status},
    release::{HttpReleaseFetcher, ReleaseError, ReleaseFetcher},
    store::{ProjectStore, StoreError},
    vcs::{git::GitError, svn::SvnError},
};

use parking_lot::Mutex;
use std::{
    fs::{copy, create_dir_all, remove_dir_all},
    path::PathBuf,
    sync::Arc,
};
use tracing::{info, instrument, warn};

/// Status message of successful acquisition.
pub const CREATED: &str = "CREATED";

/// Capability to acquire one kind of origin.
pub trait Acquire: Send + Sync {
    /// Origin type assigned to projects this acquirer claims.
    fn origin_type(&self) -> OriginType;

    /// Project is of the kind this acquirer handles.
    ///
    /// May probe the network.
    fn claims(&self, project: &Project) -> bool;

    /// Populate cache folder of project.
    ///
    /// Returns the cache folder. May rewrite the project's origin link into
    /// its canonical stored form.
    fn acquire(&self, project: &mut Project) -> Result<PathBuf>;
}

/// Request to cache a project.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    /// Identifier of the record in the external catalog.
    pub external_ref: Option<u64>,

    /// Remote origin to mirror or download.
    pub origin_link: Option<String>,

    /// Uploaded archive or container image.
    pub uploaded_file: Option<PathBuf>,

    pub access_class: AccessClass,

    /// Uploaded file is a container image, not a source archive.
    pub container: bool,
}

impl ArchiveRequest {
    fn validate(&self) -> Result<u64> {
        let external_ref = self
            .external_ref
            .ok_or_else(|| AcquireError::Validation("missing external reference".into()))?;

        match (&self.origin_link, &self.uploaded_file) {
            (Some(_), Some(_)) => Err(AcquireError::Validation(
                "cannot archive both an origin link and an uploaded file".into(),
            )),
            (None, None) => Err(AcquireError::Validation(
                "need either an origin link or an uploaded file".into(),
            )),
            (Some(link), None) if link.trim().is_empty() => {
                Err(AcquireError::Validation("origin link is empty".into()))
            }
            (Some(_), None) if self.container => Err(AcquireError::Validation(
                "container images must be uploaded".into(),
            )),
            _ => Ok(external_ref),
        }
    }
}

/// Acquisition dispatcher.
pub struct Dispatcher {
    store: Arc<dyn ProjectStore>,
    layout: StorageLayout,
    acquirers: Vec<Box<dyn Acquire>>,
    admission: Mutex<()>,
}

impl Dispatcher {
    /// Construct dispatcher consulting target acquirers in order.
    pub fn new(
        store: Arc<dyn ProjectStore>,
        layout: StorageLayout,
        acquirers: Vec<Box<dyn Acquire>>,
    ) -> Self {
        Self {
            store,
            layout,
            acquirers,
            admission: Mutex::new(()),
        }
    }

    /// Construct dispatcher with the standard acquirers over target remotes.
    pub fn with_remotes<F, G, S>(
        store: Arc<dyn ProjectStore>,
        layout: StorageLayout,
        fetcher: F,
        git: G,
        svn: S,
    ) -> Self
    where
        F: ReleaseFetcher + 'static,
        G: VcsRemote + 'static,
        S: VcsRemote + 'static,
    {
        let acquirers: Vec<Box<dyn Acquire>> = vec![
            Box::new(ContainerAcquirer::new(layout.clone())),
            Box::new(FileAcquirer::new(layout.clone())),
            Box::new(TaggedReleaseAcquirer::new(layout.clone(), fetcher)),
            Box::new(GitAcquirer::new(layout.clone(), git)),
            Box::new(SubversionAcquirer::new(layout.clone(), svn)),
        ];
        Self::new(store, layout, acquirers)
    }

    /// Construct dispatcher out of configuration.
    pub fn from_settings(store: Arc<dyn ProjectStore>, settings: &Settings) -> Self {
        Self::with_remotes(
            store,
            settings.layout(),
            HttpReleaseFetcher::from_settings(settings),
            GitRemote,
            SvnRemote::new(settings.network.probe_timeout()),
        )
    }

    /// Validate, deduplicate, and acquire archive request.
    ///
    /// Returns the project as stored. Acquisition failures are recorded on
    /// the project, not returned.
    ///
    /// # Errors
    ///
    /// - Return [`AcquireError::Validation`] if the request is malformed, or
    ///   an uploaded source archive is not a recognized archive format.
    /// - Return [`AcquireError::Upload`] if the upload cannot be stored.
    /// - Return [`AcquireError::Store`] if the project store fails.
    #[instrument(skip(self, request), level = "debug")]
    pub fn submit(&self, request: ArchiveRequest) -> Result<Project> {
        let external_ref = request.validate()?;

        // INVARIANT: Held from the dedup lookup through the first save of a
        // new project, so one link never yields two projects.
        let admission = self.admission.lock();

        if let Some(link) = request.origin_link.as_deref() {
            if let Some(existing) = self.find_cached(link)? {
                let reacquire = existing.status == Status::Error;
                let existing = self
                    .store
                    .update(existing.id, &mut |project: &mut Project| {
                        project.add_external_ref(external_ref);
                        if reacquire {
                            project.status = Status::Pending;
                        }
                    })?
                    .ok_or(AcquireError::NotFound(existing.id))?;

                if !reacquire {
                    info!("{link} already cached as project {}", existing.id);
                    return Ok(existing);
                }

                info!("reacquiring failed project {}", existing.id);
                drop(admission);
                return self.acquire(existing.id);
            }
        }

        let mut project = Project::new(request.access_class);
        project.add_external_ref(external_ref);
        project.origin_link = request.origin_link.as_deref().map(normalize_link);

        if let Some(upload) = request.uploaded_file.as_deref() {
            if request.container {
                project.assign_origin_type(OriginType::Container)?;
            }

            let stored = self.layout.upload_path(&project, upload).ok_or_else(|| {
                AcquireError::Validation(format!("{:?} is not a file name", upload.display()))
            })?;
            let upload_err = |err| AcquireError::Upload {
                source: err,
                path: stored.clone(),
            };
            create_dir_all(self.layout.project_dir(&project)).map_err(upload_err)?;
            copy(upload, &stored).map_err(upload_err)?;

            if !request.container {
                if let Err(error) = detect_file_format(&stored) {
                    self.discard(&project);
                    return Err(AcquireError::Validation(format!(
                        "{:?} is not a supported archive: {error}",
                        upload.display()
                    )));
                }
            }
            project.uploaded_file = Some(stored);
        }

        let project = self.store.save(&project)?;
        drop(admission);
        self.acquire(project.id)
    }

    /// Acquire stored project, recording exactly one terminal status.
    ///
    /// External references mapped onto the project while it is being
    /// acquired are kept.
    ///
    /// # Errors
    ///
    /// - Return [`AcquireError::NotFound`] if no such project is stored.
    /// - Return [`AcquireError::Store`] if the project store fails.
    #[instrument(skip(self), level = "debug")]
    pub fn acquire(&self, id: ProjectId) -> Result<Project> {
        let mut project = self
            .store
            .find_by_id(id)?
            .ok_or(AcquireError::NotFound(id))?;

        match self.classify_and_acquire(&mut project) {
            Ok(folder) => {
                info!("acquired project {id} into {:?}", folder.display());
                project.complete_with(folder, CREATED);
            }
            Err(error) => {
                warn!("failed to acquire project {id}: {error}");
                project.fail_with(error.to_string());
            }
        }

        let stored = self.store.update(id, &mut |stored: &mut Project| {
            let mapped = stored.external_refs().collect::<Vec<_>>();
            *stored = project.clone();
            for external_ref in mapped {
                stored.add_external_ref(external_ref);
            }
        })?;

        stored.ok_or(AcquireError::NotFound(id))
    }

    fn classify_and_acquire(&self, project: &mut Project) -> Result<PathBuf> {
        let acquirer = self
            .acquirers
            .iter()
            .find(|acquirer| acquirer.claims(project))
            .ok_or(AcquireError::UnknownOriginType)?;

        project.assign_origin_type(acquirer.origin_type())?;
        acquirer.acquire(project)
    }

    fn find_cached(&self, link: &str) -> Result<Option<Project>> {
        for candidate in link_candidates(link) {
            if let Some(project) = self.store.find_by_origin_link(&candidate)? {
                return Ok(Some(project));
            }
        }

        Ok(None)
    }

    fn discard(&self, project: &Project) {
        let dir = self.layout.project_dir(project);
        if let Err(error) = remove_dir_all(&dir) {
            warn!("failed to remove {:?}: {error}", dir.display());
        }
    }
}

/// Acquisition error types.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// Request is malformed.
    #[error("invalid archive request: {0}")]
    Validation(String),

    /// No project with target identifier is stored.
    #[error("project {0} not found")]
    NotFound(ProjectId),

    /// No acquirer claims the project.
    #[error("Unable to determine origin type")]
    UnknownOriginType,

    /// Project invariant violated.
    #[error(transparent)]
    Project(#[from] ProjectError),

    /// Uploaded file cannot be stored.
    #[error("failed to store upload at {:?}", path.display())]
    Upload {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Cache folder cannot be prepared.
    #[error("Cache Folder Error: {0}")]
    CacheFolder(#[from] std::io::Error),

    /// Archive cannot be extracted.
    #[error("Archive Error: {0}")]
    Extract(#[from] ExtractError),

    /// Tagged release cannot be downloaded.
    #[error("Tagged Release Error: {0}")]
    Release(#[from] ReleaseError),

    /// Git remote cannot be probed or cloned.
    #[error("Checkout Error: {0}")]
    Git(#[from] GitError),

    /// Subversion remote cannot be probed or checked out.
    #[error("Checkout Error: {0}")]
    Svn(#[from] SvnError),

    /// Project store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = AcquireError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::{
        fs::{read_to_string, write},
        io::Write,
        path::Path,
    };
    use tempfile::TempDir;

    /// Remote that answers probes for a fixed set of links.
    #[derive(Default)]
    struct FakeRemote {
        known: Vec<String>,
        checkouts: Mutex<Vec<String>>,
    }

    impl FakeRemote {
        fn knowing(links: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                known: links.iter().map(ToString::to_string).collect(),
                checkouts: Mutex::new(Vec::new()),
            })
        }
    }

    impl VcsRemote for Arc<FakeRemote> {
        fn probe(&self, url: &str) -> Result<()> {
            if self.known.iter().any(|known| known == url) {
                Ok(())
            } else {
                Err(AcquireError::Validation(format!("unknown remote {url}")))
            }
        }

        fn checkout(&self, url: &str, path: &Path) -> Result<()> {
            self.checkouts.lock().push(url.to_string());
            write(path.join("README"), url)?;
            Ok(())
        }
    }

    /// Fetcher that serves one fixed archive.
    struct FakeFetcher(Vec<u8>);

    impl ReleaseFetcher for FakeFetcher {
        fn fetch(&self, _url: &str, destination: &Path) -> crate::release::Result<u64> {
            create_dir_all(destination.parent().unwrap()).unwrap();
            write(destination, &self.0).unwrap();
            Ok(self.0.len() as u64)
        }
    }

    fn zip_fixture(name: &str, data: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn tarball_fixture(name: &str, data: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    // INVARIANT: Raw header bypasses the builder's own path checks.
    fn escaping_tar_fixture(name: &str, data: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_old();
        header.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder.append(&header, data.as_bytes()).unwrap();
        builder.into_inner().unwrap()
    }

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        git: Arc<FakeRemote>,
        svn: Arc<FakeRemote>,
        dispatcher: Dispatcher,
    }

    impl Fixture {
        fn new(git: &[&str], svn: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = StorageLayout::new(dir.path().join("archive"), dir.path().join("limited"));
            let store = Arc::new(MemoryStore::new());
            let git = FakeRemote::knowing(git);
            let svn = FakeRemote::knowing(svn);
            let fetcher = FakeFetcher(tarball_fixture("repo-v1/README.md", "release"));
            let dispatcher = Dispatcher::with_remotes(store.clone(), layout, fetcher, git.clone(), svn.clone());

            Self {
                dir,
                store,
                git,
                svn,
                dispatcher,
            }
        }

        fn upload(&self, name: &str, data: &[u8]) -> PathBuf {
            let path = self.dir.path().join("uploads").join(name);
            create_dir_all(path.parent().unwrap()).unwrap();
            write(&path, data).unwrap();
            path
        }
    }

    fn link_request(external_ref: u64, link: &str) -> ArchiveRequest {
        ArchiveRequest {
            external_ref: Some(external_ref),
            origin_link: Some(link.into()),
            ..Default::default()
        }
    }

    #[test]
    fn reject_malformed_requests() {
        let fixture = Fixture::new(&[], &[]);
        let upload = fixture.upload("a.zip", &zip_fixture("a.txt", "a"));
        let requests = [
            ArchiveRequest {
                external_ref: Some(1),
                origin_link: Some("https://example.com/a".into()),
                uploaded_file: Some(upload.clone()),
                ..Default::default()
            },
            ArchiveRequest {
                external_ref: Some(1),
                ..Default::default()
            },
            ArchiveRequest {
                origin_link: Some("https://example.com/a".into()),
                ..Default::default()
            },
            ArchiveRequest {
                external_ref: Some(1),
                origin_link: Some("https://example.com/a".into()),
                container: true,
                ..Default::default()
            },
        ];

        for request in requests {
            let result = fixture.dispatcher.submit(request);
            assert!(matches!(result, Err(AcquireError::Validation(_))));
        }
        assert!(fixture.store.is_empty());
    }

    #[test]
    fn git_link_is_normalized_and_cloned() -> anyhow::Result<()> {
        let fixture = Fixture::new(&["https://github.com/x/y.git"], &[]);

        let project = fixture.dispatcher.submit(link_request(1, "github.com/x/y"))?;
        assert_eq!(project.status, Status::Complete);
        assert_eq!(project.status_message, CREATED);
        assert_eq!(project.origin_type(), Some(OriginType::Git));
        assert_eq!(project.origin_link.as_deref(), Some("https://github.com/x/y.git"));

        let folder = project.cache_folder().unwrap();
        assert_eq!(read_to_string(folder.join("README"))?, "https://github.com/x/y.git");
        assert!(folder.starts_with(fixture.dir.path().join("archive").join(project.id.to_string())));

        Ok(())
    }

    #[test]
    fn subversion_is_probed_after_git() -> anyhow::Result<()> {
        let fixture = Fixture::new(&[], &["https://svn.example.com/repo"]);

        let project = fixture
            .dispatcher
            .submit(link_request(1, "http://svn.example.com/repo/"))?;
        assert_eq!(project.origin_type(), Some(OriginType::Subversion));
        assert_eq!(project.origin_link.as_deref(), Some("https://svn.example.com/repo"));
        assert_eq!(*fixture.svn.checkouts.lock(), vec!["https://svn.example.com/repo"]);

        Ok(())
    }

    #[test]
    fn unknown_remote_is_recorded_as_error() -> anyhow::Result<()> {
        let fixture = Fixture::new(&[], &[]);

        let project = fixture.dispatcher.submit(link_request(1, "https://example.com/nothing"))?;
        assert_eq!(project.status, Status::Error);
        assert_eq!(project.status_message, "Unable to determine origin type");
        assert_eq!(project.cache_folder(), None);
        assert_eq!(project.origin_type(), None);

        Ok(())
    }

    #[test]
    fn cached_link_maps_new_reference_without_refetch() -> anyhow::Result<()> {
        let fixture = Fixture::new(&["https://github.com/x/y.git"], &[]);

        let first = fixture.dispatcher.submit(link_request(1, "https://github.com/x/y"))?;
        let second = fixture.dispatcher.submit(link_request(2, "http://GITHUB.com/x/y.git/"))?;

        assert_eq!(second.id, first.id);
        assert_eq!(second.external_refs().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second.cache_folder(), first.cache_folder());
        assert_eq!(fixture.git.checkouts.lock().len(), 1);
        assert_eq!(fixture.store.len(), 1);

        Ok(())
    }

    #[test]
    fn concurrent_requests_for_one_link_share_a_project() -> anyhow::Result<()> {
        let fixture = Fixture::new(&["https://github.com/x/y.git"], &[]);

        let projects = std::thread::scope(|scope| {
            let workers = (1..=8)
                .map(|external_ref| {
                    let dispatcher = &fixture.dispatcher;
                    scope.spawn(move || dispatcher.submit(link_request(external_ref, "github.com/x/y")))
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap())
                .collect::<Result<Vec<_>>>()
        })?;

        assert!(projects.windows(2).all(|pair| pair[0].id == pair[1].id));
        assert_eq!(fixture.store.len(), 1);
        assert_eq!(fixture.git.checkouts.lock().len(), 1);

        let stored = fixture.store.find_by_id(projects[0].id)?.unwrap();
        assert_eq!(stored.status, Status::Complete);
        assert_eq!(stored.external_refs().collect::<Vec<_>>(), (1..=8).collect::<Vec<_>>());

        Ok(())
    }

    #[test]
    fn failed_project_is_reacquired() -> anyhow::Result<()> {
        let fixture = Fixture::new(&["https://github.com/x/y.git"], &[]);
        let mut failed = Project::new(AccessClass::Standard);
        failed.origin_link = Some("https://github.com/x/y.git".into());
        failed.add_external_ref(1);
        failed.fail_with("Checkout Error: timed out");
        let failed = fixture.store.save(&failed)?;

        let project = fixture.dispatcher.submit(link_request(2, "github.com/x/y"))?;
        assert_eq!(project.id, failed.id);
        assert_eq!(project.status, Status::Complete);
        assert_eq!(project.external_refs().collect::<Vec<_>>(), vec![1, 2]);

        Ok(())
    }

    #[test]
    fn uploaded_archive_is_extracted() -> anyhow::Result<()> {
        let fixture = Fixture::new(&[], &[]);
        let upload = fixture.upload("source.zip", &zip_fixture("a/b.txt", "hello"));

        let project = fixture.dispatcher.submit(ArchiveRequest {
            external_ref: Some(7),
            uploaded_file: Some(upload),
            access_class: AccessClass::Restricted,
            ..Default::default()
        })?;

        assert_eq!(project.status, Status::Complete);
        assert_eq!(project.origin_type(), Some(OriginType::File));
        let folder = project.cache_folder().unwrap();
        assert!(folder.starts_with(fixture.dir.path().join("limited")));
        assert_eq!(read_to_string(folder.join("a/b.txt"))?, "hello");
        assert!(project.uploaded_file.unwrap().ends_with("source.zip"));

        Ok(())
    }

    #[test]
    fn unrecognized_upload_is_rejected_before_saving() {
        let fixture = Fixture::new(&[], &[]);
        let upload = fixture.upload("notes.zip", b"not an archive at all");

        let result = fixture.dispatcher.submit(ArchiveRequest {
            external_ref: Some(7),
            uploaded_file: Some(upload),
            ..Default::default()
        });

        assert!(matches!(result, Err(AcquireError::Validation(_))));
        assert!(fixture.store.is_empty());
    }

    #[test]
    fn escaping_upload_is_recorded_as_error() -> anyhow::Result<()> {
        let fixture = Fixture::new(&[], &[]);
        let upload = fixture.upload("evil.tar", &escaping_tar_fixture("../../escape.txt", "gotcha"));

        let project = fixture.dispatcher.submit(ArchiveRequest {
            external_ref: Some(7),
            uploaded_file: Some(upload),
            ..Default::default()
        })?;

        assert_eq!(project.status, Status::Error);
        assert!(project.status_message.starts_with("Archive Error:"));
        assert_eq!(project.cache_folder(), None);
        assert!(!fixture.dir.path().join("escape.txt").exists());
        assert!(!fixture.dir.path().join("archive").join("escape.txt").exists());

        Ok(())
    }

    #[test]
    fn container_image_is_kept_as_uploaded() -> anyhow::Result<()> {
        let fixture = Fixture::new(&[], &[]);
        let upload = fixture.upload("image.tar", b"opaque image bytes");

        let project = fixture.dispatcher.submit(ArchiveRequest {
            external_ref: Some(3),
            uploaded_file: Some(upload),
            container: true,
            ..Default::default()
        })?;

        assert_eq!(project.status, Status::Complete);
        assert_eq!(project.origin_type(), Some(OriginType::Container));
        let folder = project.cache_folder().unwrap();
        assert_eq!(folder, fixture.dir.path().join("archive").join(project.id.to_string()));
        assert!(folder.join("image.tar").is_file());

        Ok(())
    }

    #[test]
    fn tagged_release_is_downloaded_and_extracted() -> anyhow::Result<()> {
        let fixture = Fixture::new(&["https://github.com/x/y/releases/tag/v1.git"], &[]);

        let project = fixture
            .dispatcher
            .submit(link_request(1, "https://github.com/x/y/releases/tag/v1"))?;

        assert_eq!(project.origin_type(), Some(OriginType::TaggedRelease));
        let folder = project.cache_folder().unwrap();
        assert_eq!(read_to_string(folder.join("repo-v1/README.md"))?, "release");
        assert!(fixture.git.checkouts.lock().is_empty());

        Ok(())
    }
}
