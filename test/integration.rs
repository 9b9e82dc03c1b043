// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{commit_in_workdir, UpstreamFixture};

use archivist::{
    acquire::{ArchiveRequest, Dispatcher, CREATED},
    config::Settings,
    maintain::MaintenanceJob,
    project::{AccessClass, OriginType, Project, Status},
    schedule::Scheduler,
    store::{FileStore, MemoryStore, ProjectStore},
    vcs::git::{clone_mirror, refresh_mirror, GitMirror},
};

use anyhow::Result;
use flate2::{write::GzEncoder, Compression};
use git2::Repository;
use pretty_assertions::assert_eq;
use std::{
    fs::{read_to_string, write},
    sync::Arc,
};

#[test]
fn refresh_fast_forwards_to_upstream() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "first")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    upstream.stage_and_commit("CHANGES.md", "second")?;
    let summary = refresh_mirror(&mirror)?;

    assert!(summary.starts_with("fast-forwarded main"), "{summary}");
    assert_eq!(read_to_string(mirror.path().join("CHANGES.md"))?, "second");

    let summary = refresh_mirror(&mirror)?;
    assert_eq!(summary, "main already up to date");

    Ok(())
}

#[test]
fn refresh_resets_dirty_working_tree() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "pristine")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    write(mirror.path().join("README.md"), "scribbled over")?;
    assert!(!mirror.is_clean()?);

    refresh_mirror(&mirror)?;
    assert!(mirror.is_clean()?);
    assert_eq!(read_to_string(mirror.path().join("README.md"))?, "pristine");

    Ok(())
}

#[test]
fn refresh_recovers_from_conflicting_local_commit() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "base")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    let local = Repository::open(mirror.path())?;
    commit_in_workdir(&local, "README.md", "local edit")?;
    upstream.stage_and_commit("README.md", "upstream edit")?;

    let summary = refresh_mirror(&mirror)?;
    assert_eq!(summary, "main already up to date");
    assert_eq!(read_to_string(mirror.path().join("README.md"))?, "upstream edit");
    assert_eq!(local.state(), git2::RepositoryState::Clean);

    Ok(())
}

#[test]
fn refresh_follows_renamed_default_branch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "hello")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    upstream.rename_default_branch("main", "trunk")?;
    upstream.stage_and_commit("NEWS.md", "renamed")?;
    refresh_mirror(&mirror)?;

    let local = Repository::open(mirror.path())?;
    assert_eq!(local.head()?.name(), Some("refs/heads/trunk"));
    assert_eq!(read_to_string(mirror.path().join("NEWS.md"))?, "renamed");

    Ok(())
}

#[test]
fn stale_index_lock_is_cleared_after_failed_refresh() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "first")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;
    upstream.stage_and_commit("CHANGES.md", "second")?;

    let lock = mirror.path().join(".git").join("index.lock");
    write(&lock, "")?;
    assert!(refresh_mirror(&mirror).is_err());
    assert!(!lock.exists());

    refresh_mirror(&mirror)?;
    assert_eq!(read_to_string(mirror.path().join("CHANGES.md"))?, "second");
    assert!(mirror.is_clean()?);

    Ok(())
}

#[test]
fn reset_falls_back_to_origin_main_without_remote_head() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "first")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    upstream.stage_and_commit("CHANGES.md", "second")?;
    upstream.point_head_at("refs/heads/gone")?;
    write(mirror.path().join("README.md"), "scribbled over")?;

    mirror.reset()?;

    let local = Repository::open(mirror.path())?;
    assert_eq!(local.head()?.peel_to_commit()?.id(), upstream.branch_tip("main")?);
    assert_eq!(read_to_string(mirror.path().join("README.md"))?, "first");
    assert_eq!(read_to_string(mirror.path().join("CHANGES.md"))?, "second");

    Ok(())
}

#[test]
fn checkout_recreates_tracking_branch_after_rename() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "hello")?;
    let mirror = clone_mirror(&upstream.url(), dir.path().join("mirror"))?;

    upstream.rename_default_branch("main", "trunk")?;
    mirror.reset()?;
    mirror.checkout()?;

    let local = Repository::open(mirror.path())?;
    assert_eq!(local.head()?.name(), Some("refs/heads/trunk"));
    let tracking = local.find_branch("trunk", git2::BranchType::Local)?;
    assert_eq!(tracking.upstream()?.name()?, Some("origin/trunk"));
    assert_eq!(local.head()?.peel_to_commit()?.id(), upstream.branch_tip("trunk")?);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn maintenance_pass_refreshes_cached_mirrors() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let upstream = UpstreamFixture::new(dir.path().join("upstream.git"))?;
    upstream.stage_and_commit("README.md", "first")?;
    let cache = dir.path().join("cache");
    clone_mirror(&upstream.url(), &cache)?;
    upstream.stage_and_commit("CHANGES.md", "second")?;

    let store = Arc::new(MemoryStore::new());
    let mut mirror = Project::new(AccessClass::Standard);
    mirror.origin_link = Some(upstream.url());
    mirror.assign_origin_type(OriginType::Git)?;
    mirror.complete_with(&cache, CREATED);
    let mirror = store.save(&mirror)?;

    let mut broken = Project::new(AccessClass::Standard);
    broken.assign_origin_type(OriginType::Git)?;
    broken.complete_with(dir.path().join("missing"), CREATED);
    let broken = store.save(&broken)?;

    let scheduler = Scheduler::new(
        MaintenanceJob::from_settings(&Settings::default()),
        store.clone(),
        2,
    );
    scheduler.start().await?;
    scheduler.wait_idle().await;
    assert_eq!(scheduler.status().processed, 2);

    let result = store.find_by_id(mirror.id)?.unwrap();
    assert_eq!(result.maintenance_status, Some(Status::Complete));
    assert!(result
        .maintenance_message
        .as_deref()
        .is_some_and(|message| message.starts_with("fast-forwarded main")));
    assert_eq!(read_to_string(cache.join("CHANGES.md"))?, "second");

    let result = store.find_by_id(broken.id)?.unwrap();
    assert_eq!(result.maintenance_status, Some(Status::Error));
    assert!(result.last_maintained_at.is_some());

    Ok(())
}

#[test]
fn uploaded_tarball_is_archived_and_persisted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut settings = Settings::default();
    settings.storage.archive_dir = dir.path().join("archive");
    settings.storage.limited_archive_dir = dir.path().join("limited");
    settings.storage.store_file = dir.path().join("projects.json");

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let data = b"fn main() {}\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "src/main.rs", &data[..])?;
    let upload = dir.path().join("upload.tgz");
    write(&upload, builder.into_inner()?.finish()?)?;

    let store: Arc<dyn ProjectStore> = Arc::new(FileStore::open(&settings.storage.store_file)?);
    let dispatcher = Dispatcher::from_settings(store, &settings);
    let project = dispatcher.submit(ArchiveRequest {
        external_ref: Some(7),
        uploaded_file: Some(upload),
        ..Default::default()
    })?;

    assert_eq!(project.status, Status::Complete);
    assert_eq!(project.origin_type(), Some(OriginType::File));
    let folder = project.cache_folder().unwrap();
    assert!(folder.starts_with(dir.path().join("archive")));
    assert_eq!(read_to_string(folder.join("src/main.rs"))?, "fn main() {}\n");

    let reopened = FileStore::open(&settings.storage.store_file)?;
    assert_eq!(reopened.find_by_id(project.id)?, Some(project));

    Ok(())
}
