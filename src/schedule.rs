// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Background batch scheduling.
//!
//! A [`Scheduler`] runs one kind of [`BatchJob`] over every eligible project
//! in the store, spreading the work over a bounded pool of workers. Each
//! scheduler runs at most one batch at a time. Calling [`Scheduler::start`]
//! while a batch is in flight does nothing, no matter how many callers race
//! to start one.
//!
//! Planning a batch, i.e., listing its eligible projects, runs on the
//! blocking pool like the work itself, so a slow store never stalls the
//! runtime. A batch being planned already counts as in flight.
//!
//! Every task re-reads its project from the store before working on it, so a
//! project that changed state since the batch was planned is skipped rather
//! than processed from a stale copy. Finished tasks are counted whether their
//! work succeeded, failed, or panicked.

use crate::{
    project::{Project, ProjectId},
    store::{self, ProjectStore, StoreError},
};

use parking_lot::Mutex;
use serde::Serialize;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, warn};

/// Unit of batch work applied to one project at a time.
pub trait BatchJob: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Projects this batch should visit.
    fn eligible(&self, store: &dyn ProjectStore) -> store::Result<Vec<Project>>;

    /// Freshly loaded project is still in the state this batch expects.
    fn ready(&self, project: &Project) -> bool;

    /// Do the work, recording the outcome through the store.
    ///
    /// Runs on a blocking worker thread.
    fn run(&self, store: &dyn ProjectStore, project: Project);
}

/// Snapshot of batch progress.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub active: bool,
    pub total: u64,
    pub processed: u64,
}

/// Bounded pool running one batch at a time.
pub struct Scheduler<J>
where
    J: BatchJob,
{
    job: Arc<J>,
    store: Arc<dyn ProjectStore>,
    permits: Arc<Semaphore>,
    total: AtomicU64,
    processed: Arc<AtomicU64>,
    planning: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<J> Scheduler<J>
where
    J: BatchJob,
{
    /// Construct scheduler running target job on at most `workers` projects
    /// concurrently.
    pub fn new(job: J, store: Arc<dyn ProjectStore>, workers: usize) -> Self {
        Self {
            job: Arc::new(job),
            store,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            total: AtomicU64::new(0),
            processed: Arc::new(AtomicU64::new(0)),
            planning: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    /// Start new batch unless one is already in flight.
    ///
    /// Returns true if a batch was started. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Store`] if eligible projects cannot be
    ///   listed. No batch is started.
    /// - Return [`ScheduleError::Planning`] if listing eligible projects
    ///   panicked.
    pub async fn start(&self) -> Result<bool> {
        {
            // INVARIANT: Batch is claimed under the handle lock, so only one
            //   caller ever plans it.
            let mut handles = self.handles.lock();
            if self.planning.load(Ordering::SeqCst) || any_running(&mut handles) {
                debug!("{} batch already in flight", self.job.name());
                return Ok(false);
            }
            self.planning.store(true, Ordering::SeqCst);
        }
        let _claim = Claim(&self.planning);

        let job = self.job.clone();
        let store = self.store.clone();
        let projects = tokio::task::spawn_blocking(move || job.eligible(store.as_ref())).await??;

        let mut handles = self.handles.lock();
        self.processed.store(0, Ordering::SeqCst);
        self.total.store(projects.len() as u64, Ordering::SeqCst);
        info!("{} batch started for {} projects", self.job.name(), projects.len());
        handles.extend(projects.into_iter().map(|project| self.spawn(project.id)));

        Ok(true)
    }

    /// Current batch is being planned, or some task of it has not finished.
    pub fn is_active(&self) -> bool {
        self.planning.load(Ordering::SeqCst) || any_running(&mut self.handles.lock())
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus {
            active: self.is_active(),
            total: self.total.load(Ordering::SeqCst),
            processed: self.processed.load(Ordering::SeqCst),
        }
    }

    /// Wait until the current batch, if any, has finished.
    pub async fn wait_idle(&self) {
        while self.is_active() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn spawn(&self, id: ProjectId) -> JoinHandle<()> {
        let job = self.job.clone();
        let store = self.store.clone();
        let permits = self.permits.clone();
        let processed = self.processed.clone();

        tokio::spawn(async move {
            let _done = Completion(processed);
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let name = job.name();
            let work = tokio::task::spawn_blocking(move || process(job.as_ref(), store.as_ref(), id));
            if let Err(error) = work.await {
                warn!("{name} task for project {id} did not finish: {error}");
            }
        })
    }
}

/// Releases claim on planning a batch once it is dropped.
struct Claim<'a>(&'a AtomicBool);

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Counts a task as processed once it is dropped.
struct Completion(Arc<AtomicU64>);

impl Drop for Completion {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn any_running(handles: &mut Vec<JoinHandle<()>>) -> bool {
    if handles.iter().all(JoinHandle::is_finished) {
        handles.clear();
        false
    } else {
        true
    }
}

fn process<J>(job: &J, store: &dyn ProjectStore, id: ProjectId)
where
    J: BatchJob + ?Sized,
{
    match store.find_by_id(id) {
        Ok(Some(project)) if job.ready(&project) => job.run(store, project),
        Ok(Some(_)) => debug!("project {id} no longer ready for {}", job.name()),
        Ok(None) => warn!("project {id} vanished before {}", job.name()),
        Err(error) => warn!("failed to load project {id} for {}: {error}", job.name()),
    }
}

/// Scheduling error types.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("planning of batch did not finish: {0}")]
    Planning(#[from] JoinError),
}

/// Friendly result alias :3
pub type Result<T, E = ScheduleError> = std::result::Result<T, E>;
