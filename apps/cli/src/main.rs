use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use skyhaul_credentials::{CredentialAllocator, DisabledAllocator, HttpAllocator};
use skyhaul_uploader::{
    HttpBackend, JobSnapshot, NoopPlatform, StaticSession, Submission, UploadEvent,
    UploadService, UploaderConfig,
};

#[derive(Parser)]
#[command(name = "skyhaul", version, about = "Resumable background uploads")]
struct Cli {
    /// Configuration file (defaults to <config dir>/skyhaul/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Account whose workspace is used.
    #[arg(long, env = "SKYHAUL_ACCOUNT", global = true)]
    account: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload files and wait until every one has completed.
    Upload {
        files: Vec<PathBuf>,

        /// Move the files into the workspace instead of copying them.
        #[arg(long = "move")]
        move_files: bool,

        /// Content type for all files (detected from the extension otherwise).
        #[arg(long)]
        content_type: Option<String>,

        /// Metadata entry carried to the completion event, as KEY=VALUE.
        #[arg(long = "meta", value_parser = parse_meta)]
        metadata: Vec<(String, String)>,
    },
    /// Resume pending uploads and wait for them to complete.
    Resume,
    /// List the jobs of the workspace.
    List,
    /// Cancel a job and delete its files.
    Cancel { job_id: String },
    /// Forget a completed job.
    Ack { job_id: String },
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skyhaul=debug")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => UploaderConfig::load_from(path),
        None => UploaderConfig::load(),
    }
    .context("failed to load configuration")?;
    config.validate()?;

    let Some(account) = cli.account else {
        bail!("no account given (use --account or SKYHAUL_ACCOUNT)");
    };

    let allocator: Arc<dyn CredentialAllocator> = if config.allocation_enabled() {
        Arc::new(HttpAllocator::new(
            &config.allocation_url,
            &config.allocation_token,
        )?)
    } else {
        tracing::warn!("no allocation endpoint configured, only cached credentials are used");
        Arc::new(DisabledAllocator)
    };

    let service = UploadService::spawn(
        config,
        Arc::new(StaticSession::new(Some(account))),
        allocator,
        Arc::new(HttpBackend::new()?),
        Arc::new(NoopPlatform),
    );
    let mut events = service
        .take_events()
        .context("event stream already taken")?;

    service.enable_reporting().await?;
    let loaded = service.open_session().await?;
    tracing::debug!(jobs = loaded, "workspace loaded");

    let result = run(&service, &mut events, cli.command).await;
    service.shutdown().await?;
    result
}

async fn run(
    service: &UploadService,
    events: &mut UnboundedReceiver<UploadEvent>,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Upload {
            files,
            move_files,
            content_type,
            metadata,
        } => {
            if files.is_empty() {
                bail!("nothing to upload");
            }
            let mut waiting = HashSet::new();
            for path in files {
                let mut submission = if move_files {
                    Submission::moving(&path)
                } else {
                    Submission::copy(&path)
                };
                if let Some(ct) = &content_type {
                    submission = submission.with_content_type(ct);
                }
                for (key, value) in &metadata {
                    submission =
                        submission.with_metadata(key, serde_json::Value::from(value.as_str()));
                }
                let job = service
                    .submit(submission)
                    .await
                    .with_context(|| format!("cannot upload {}", path.display()))?;
                println!("queued {} ({} bytes) as {}", path.display(), job.byte_size, job.id);
                waiting.insert(job.id);
            }
            wait_for(events, waiting).await
        }
        Command::Resume => {
            let waiting: HashSet<String> = service
                .list()
                .await?
                .into_iter()
                .filter(|job| job.completed_at.is_none())
                .map(|job| job.id)
                .collect();
            if waiting.is_empty() {
                println!("nothing to resume");
                return Ok(());
            }
            wait_for(events, waiting).await
        }
        Command::List => {
            for job in service.list().await? {
                print_job(&job);
            }
            Ok(())
        }
        Command::Cancel { job_id } => {
            if !service.cancel(&job_id).await? {
                bail!("unknown job {job_id}");
            }
            println!("cancelled {job_id}");
            Ok(())
        }
        Command::Ack { job_id } => {
            if !service.acknowledge(&job_id).await? {
                bail!("job {job_id} is unknown or not completed");
            }
            println!("forgot {job_id}");
            Ok(())
        }
    }
}

/// Prints lifecycle events until every job in `waiting` has completed or
/// the user interrupts.
async fn wait_for(
    events: &mut UnboundedReceiver<UploadEvent>,
    mut waiting: HashSet<String>,
) -> anyhow::Result<()> {
    while !waiting.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted, {} upload(s) resume on the next run", waiting.len());
                return Ok(());
            }
        };
        let Some(event) = event else {
            bail!("upload service stopped");
        };
        match event {
            UploadEvent::TransferStarted { job, credential } => {
                println!("{}: sending via {}", job.id, credential.provider);
            }
            UploadEvent::Progress(job) => {
                let eta = job
                    .eta
                    .map(|d| format!(", {}s left", d.as_secs()))
                    .unwrap_or_default();
                println!(
                    "{}: {:5.1}% ({:.0} KiB/s{eta})",
                    job.id,
                    job.fraction() * 100.0,
                    job.bytes_per_second / 1024.0,
                );
            }
            UploadEvent::Completed(job) => {
                if waiting.remove(&job.id) {
                    println!("{}: done, {}", job.id, job.public_url());
                }
            }
            UploadEvent::BackgroundWorkFinished => {}
        }
    }
    Ok(())
}

fn print_job(job: &JobSnapshot) {
    let state = if job.completed_at.is_some() {
        "completed"
    } else if job.started_at.is_some() {
        "started"
    } else {
        "queued"
    };
    println!(
        "{}  {:<9}  {:>12} bytes  {}  restarts={}",
        job.id, state, job.byte_size, job.content_type, job.restart_count
    );
}
