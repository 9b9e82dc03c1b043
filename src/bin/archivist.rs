// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use archivist::{
    acquire::{ArchiveRequest, Dispatcher},
    config::Settings,
    labor::{ClocEstimator, LaborHoursJob},
    maintain::MaintenanceJob,
    path::default_config_path,
    project::{AccessClass, ProjectId, Status},
    schedule::{BatchJob, Scheduler},
    store::{FileStore, ProjectStore},
    vcs::git::configure_timeouts,
};

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{fs::read_to_string, path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "archivist [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let settings = load_settings(self.config)?;
        configure_timeouts(settings.network.probe_timeout())?;
        let store: Arc<dyn ProjectStore> = Arc::new(FileStore::open(&settings.storage.store_file)?);

        match self.command {
            Command::Archive(opts) => run_archive(opts, store, settings).await,
            Command::Maintain => run_maintain(store, &settings).await,
            Command::Labor => run_labor(store, &settings).await,
            Command::Status(opts) => run_status(opts, store.as_ref()),
            Command::Serve => run_serve(store, &settings).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Cache project from remote link or uploaded file.
    #[command(override_usage = "archivist archive [options] <external_ref> (--link <url> | --file <path>)")]
    Archive(ArchiveOptions),

    /// Run one maintenance pass over every cached mirror.
    Maintain,

    /// Run one labor hour pass over every project needing an estimate.
    Labor,

    /// Show stored project records as JSON.
    #[command(override_usage = "archivist status [options] [<project_id>]")]
    Status(StatusOptions),

    /// Run maintenance and labor hour passes on a schedule until interrupted.
    Serve,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
#[command(group(ArgGroup::new("origin").required(true).args(["link", "file"])))]
struct ArchiveOptions {
    /// Identifier of the record in the external catalog.
    #[arg(required = true, value_name = "external_ref")]
    pub external_ref: u64,

    /// Link to remote repository or tagged release.
    #[arg(short, long, value_name = "url")]
    pub link: Option<String>,

    /// Path to source archive or container image to upload.
    #[arg(short, long, value_name = "path")]
    pub file: Option<PathBuf>,

    /// Keep project files in the restricted storage area.
    #[arg(short, long)]
    pub restricted: bool,

    /// Uploaded file is a container image.
    #[arg(long, requires = "file")]
    pub container: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct StatusOptions {
    /// Identifier of project to show; all projects are shown without one.
    #[arg(value_name = "project_id")]
    pub project_id: Option<ProjectId>,

    /// Show only projects whose acquisition failed.
    #[arg(short, long, conflicts_with = "project_id")]
    pub errors: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let path = match path {
        Some(path) => path,
        None => {
            let path = default_config_path()?;
            if !path.exists() {
                info!("no configuration at {:?}, using defaults", path.display());
                return Ok(Settings::try_default()?);
            }
            path
        }
    };

    let data = read_to_string(&path)
        .with_context(|| format!("failed to read configuration {:?}", path.display()))?;
    Ok(data.parse()?)
}

async fn run_archive(opts: ArchiveOptions, store: Arc<dyn ProjectStore>, settings: Settings) -> Result<()> {
    let request = ArchiveRequest {
        external_ref: Some(opts.external_ref),
        origin_link: opts.link,
        uploaded_file: opts.file,
        access_class: if opts.restricted {
            AccessClass::Restricted
        } else {
            AccessClass::Standard
        },
        container: opts.container,
    };

    let dispatcher = Dispatcher::from_settings(store, &settings);
    let project = tokio::task::spawn_blocking(move || dispatcher.submit(request)).await??;
    println!("{}", serde_json::to_string_pretty(&project)?);

    if project.status == Status::Error {
        return Err(anyhow!("project {} failed: {}", project.id, project.status_message));
    }

    Ok(())
}

async fn run_maintain(store: Arc<dyn ProjectStore>, settings: &Settings) -> Result<()> {
    let job = MaintenanceJob::from_settings(settings);
    let scheduler = Scheduler::new(job, store, settings.maintenance.workers);
    run_with_progress(&scheduler).await
}

async fn run_labor(store: Arc<dyn ProjectStore>, settings: &Settings) -> Result<()> {
    let job = LaborHoursJob::new(ClocEstimator::from_settings(settings));
    let scheduler = Scheduler::new(job, store, settings.labor.workers);
    run_with_progress(&scheduler).await
}

async fn run_with_progress<J: BatchJob>(scheduler: &Scheduler<J>) -> Result<()> {
    scheduler.start().await?;

    let bar = ProgressBar::new(scheduler.status().total);
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<20}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(scheduler.job().name());
    bar.enable_steady_tick(Duration::from_millis(100));

    loop {
        let status = scheduler.status();
        bar.set_position(status.processed);
        if !status.active {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    bar.finish();

    Ok(())
}

fn run_status(opts: StatusOptions, store: &dyn ProjectStore) -> Result<()> {
    let json = match opts.project_id {
        Some(id) => {
            let project = store
                .find_by_id(id)?
                .ok_or_else(|| anyhow!("project {id} not found"))?;
            serde_json::to_string_pretty(&project)?
        }
        None if opts.errors => serde_json::to_string_pretty(&store.find_by_status(Status::Error)?)?,
        None => {
            let mut projects = Vec::new();
            for status in [Status::Pending, Status::Processing, Status::Complete, Status::Error] {
                projects.extend(store.find_by_status(status)?);
            }
            serde_json::to_string_pretty(&projects)?
        }
    };
    println!("{json}");

    Ok(())
}

async fn run_serve(store: Arc<dyn ProjectStore>, settings: &Settings) -> Result<()> {
    let maintenance = Scheduler::new(
        MaintenanceJob::from_settings(settings),
        store.clone(),
        settings.maintenance.workers,
    );
    let labor = Scheduler::new(
        LaborHoursJob::new(ClocEstimator::from_settings(settings)),
        store,
        settings.labor.workers,
    );

    let mut ticks = tokio::time::interval(Duration::from_secs(settings.maintenance.interval.max(1)));
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                if let Err(error) = maintenance.start().await {
                    error!("failed to start maintenance pass: {error}");
                }
                if let Err(error) = labor.start().await {
                    error!("failed to start labor hour pass: {error}");
                }
                info!(maintenance = ?maintenance.status(), labor = ?labor.status(), "passes scheduled");
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("interrupted, waiting for in-flight passes to finish");
                break;
            }
        }
    }

    maintenance.wait_idle().await;
    labor.wait_idle().await;

    Ok(())
}
