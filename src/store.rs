// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Project store access.
//!
//! Archivist keeps every project record in a __project store__. The store is
//! an external collaborator as far as acquisition and maintenance are
//! concerned: they only ever look records up and save them back through the
//! [`ProjectStore`] trait.
//!
//! Long running work never saves a copy of a project it loaded before the
//! work started. It applies only the fields it owns through
//! [`ProjectStore::update`], so acquisition, maintenance, and labor hours
//! can touch the same project at once without undoing each other.
//!
//! # Store Implementations
//!
//! Two stores are provided. [`MemoryStore`] keeps records in memory and is
//! what tests and embedders use. [`FileStore`] keeps records in a single JSON
//! snapshot file, which is what the command line tool uses.
//!
//! Any number of [`FileStore`] handles, in any number of processes, may share
//! one snapshot. Every write is a read-modify-write of the snapshot under an
//! exclusive lock on a sibling `.lock` file, and the snapshot is replaced
//! atomically through a temporary file in the same directory. Readers never
//! lock, because they can only ever observe a complete snapshot.

use crate::project::{OriginType, Project, ProjectId, Status};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{create_dir_all, read_to_string, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

/// Layer of indirection for project persistence.
pub trait ProjectStore: Send + Sync + 'static {
    /// Look up project by identifier.
    fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Look up project by normalized origin link, ignoring ASCII case.
    fn find_by_origin_link(&self, link: &str) -> Result<Option<Project>>;

    /// List projects in target acquisition status.
    fn find_by_status(&self, status: Status) -> Result<Vec<Project>>;

    /// List projects of target origin type in target acquisition status.
    fn find_by_type(&self, origin_type: OriginType, status: Status) -> Result<Vec<Project>>;

    /// Create or update project record.
    ///
    /// Returns the record exactly as it was stored.
    fn save(&self, project: &Project) -> Result<Project>;

    /// Apply change to the latest stored version of a project in one step.
    ///
    /// Returns the record exactly as it was stored, or `None` if no project
    /// with target identifier exists.
    fn update(&self, id: ProjectId, change: &mut dyn FnMut(&mut Project)) -> Result<Option<Project>>;
}

/// In-memory project store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<ProjectId, Project>>,
}

impl MemoryStore {
    /// Construct new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored projects.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ProjectStore for MemoryStore {
    fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.records.read().get(&id).cloned())
    }

    fn find_by_origin_link(&self, link: &str) -> Result<Option<Project>> {
        Ok(find_link(&self.records.read(), link))
    }

    fn find_by_status(&self, status: Status) -> Result<Vec<Project>> {
        Ok(filter(&self.records.read(), |p| p.status == status))
    }

    fn find_by_type(&self, origin_type: OriginType, status: Status) -> Result<Vec<Project>> {
        Ok(filter(&self.records.read(), |p| {
            p.status == status && p.origin_type() == Some(origin_type)
        }))
    }

    fn save(&self, project: &Project) -> Result<Project> {
        let mut records = self.records.write();
        Ok(insert(&mut records, project))
    }

    fn update(&self, id: ProjectId, change: &mut dyn FnMut(&mut Project)) -> Result<Option<Project>> {
        let mut records = self.records.write();
        Ok(apply(&mut records, id, change))
    }
}

/// Project store persisted as a JSON snapshot.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open project store snapshot at target path.
    ///
    /// A missing snapshot is treated as an empty store, and is created on
    /// the first save.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Read`] if the snapshot exists but cannot be read.
    /// - Return [`StoreError::Decode`] if the snapshot is not valid JSON.
    #[instrument(skip(path), level = "debug")]
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut lock_path = OsString::from(path.as_os_str());
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: PathBuf::from(lock_path),
        };

        let count = store.load()?.len();
        debug!("opened store {:?} with {count} projects", store.path.display());

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn parent(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn load(&self) -> Result<BTreeMap<ProjectId, Project>> {
        let content = match read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(error) => {
                return Err(StoreError::Read {
                    source: error,
                    path: self.path.clone(),
                })
            }
        };
        let listing: Vec<Project> = serde_json::from_str(&content)?;

        Ok(listing.into_iter().map(|p| (p.id, p)).collect())
    }

    // INVARIANT: Lock is released once the returned handle drops.
    fn lock(&self) -> Result<File> {
        let lock_err = |err| StoreError::Lock {
            source: err,
            path: self.lock_path.clone(),
        };

        create_dir_all(self.parent()).map_err(lock_err)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(lock_err)?;
        FileExt::lock_exclusive(&file).map_err(lock_err)?;

        Ok(file)
    }

    fn persist(&self, records: &BTreeMap<ProjectId, Project>) -> Result<()> {
        let write_err = |err| StoreError::Write {
            source: err,
            path: self.path.clone(),
        };

        let listing = records.values().collect::<Vec<_>>();
        let content = serde_json::to_vec_pretty(&listing)?;
        let mut file = tempfile::NamedTempFile::new_in(self.parent()).map_err(write_err)?;
        file.write_all(&content).map_err(write_err)?;
        file.persist(&self.path).map_err(|err| write_err(err.error))?;

        Ok(())
    }
}

impl ProjectStore for FileStore {
    fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.load()?.remove(&id))
    }

    fn find_by_origin_link(&self, link: &str) -> Result<Option<Project>> {
        Ok(find_link(&self.load()?, link))
    }

    fn find_by_status(&self, status: Status) -> Result<Vec<Project>> {
        Ok(filter(&self.load()?, |p| p.status == status))
    }

    fn find_by_type(&self, origin_type: OriginType, status: Status) -> Result<Vec<Project>> {
        Ok(filter(&self.load()?, |p| {
            p.status == status && p.origin_type() == Some(origin_type)
        }))
    }

    #[instrument(skip(self, project), fields(project = %project.id), level = "debug")]
    fn save(&self, project: &Project) -> Result<Project> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let stored = insert(&mut records, project);
        self.persist(&records)?;

        Ok(stored)
    }

    #[instrument(skip(self, change), level = "debug")]
    fn update(&self, id: ProjectId, change: &mut dyn FnMut(&mut Project)) -> Result<Option<Project>> {
        let _lock = self.lock()?;
        let mut records = self.load()?;
        let Some(stored) = apply(&mut records, id, change) else {
            return Ok(None);
        };
        self.persist(&records)?;

        Ok(Some(stored))
    }
}

fn insert(records: &mut BTreeMap<ProjectId, Project>, project: &Project) -> Project {
    let stored = stamp(records.get(&project.id), project);
    records.insert(stored.id, stored.clone());
    stored
}

fn apply(
    records: &mut BTreeMap<ProjectId, Project>,
    id: ProjectId,
    change: &mut dyn FnMut(&mut Project),
) -> Option<Project> {
    let mut project = records.get(&id)?.clone();
    change(&mut project);
    project.id = id;
    Some(insert(records, &project))
}

fn stamp(previous: Option<&Project>, project: &Project) -> Project {
    let now = Utc::now();
    let mut stored = project.clone();
    stored.added_at = previous
        .and_then(|p| p.added_at)
        .or(project.added_at)
        .or(Some(now));
    stored.updated_at = Some(now);
    stored
}

fn find_link(records: &BTreeMap<ProjectId, Project>, link: &str) -> Option<Project> {
    records
        .values()
        .find(|p| {
            p.origin_link
                .as_deref()
                .is_some_and(|stored| stored.eq_ignore_ascii_case(link))
        })
        .cloned()
}

fn filter(
    records: &BTreeMap<ProjectId, Project>,
    predicate: impl Fn(&Project) -> bool,
) -> Vec<Project> {
    records.values().filter(|p| predicate(p)).cloned().collect()
}

/// Project store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Snapshot cannot be read.
    #[error("failed to read project store at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Snapshot lock cannot be taken.
    #[error("failed to lock project store at {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Snapshot cannot be written.
    #[error("failed to write project store at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Snapshot cannot be encoded or decoded.
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
