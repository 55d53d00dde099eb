#![forbid(unsafe_code)]

//! Command-line entry point: one-shot subcommands for scripting plus the
//! interactive shell.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tube_harvest::config::{HarvestSettings, SettingsOverrides, resolve_settings};
use tube_harvest::metadata::MetadataStore;
use tube_harvest::pipeline::IngestPipeline;
use tube_harvest::shell::{LogSink, SearchArgs, Shell, spawn_log_view};
use tube_harvest::youtube::{DataApiClient, Gateway};

#[derive(Parser, Debug)]
#[command(name = "harvest", version, about = "Collects YouTube video, channel and comment metadata into SQLite")]
struct Cli {
    /// Settings file read before the process environment.
    #[arg(long, global = true, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    /// How many videos may be fetched and stored at once.
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the ids of the videos a search finds.
    Search(SearchArgs),

    /// Ingests the given videos (ids or URLs).
    Ingest {
        #[arg(required = true)]
        videos: Vec<String>,
    },

    /// Searches, then ingests everything found.
    Harvest(SearchArgs),

    /// Starts the interactive shell.
    Shell,

    /// Prints how many rows each table holds.
    Stats,

    /// Deletes a stored video together with its comments.
    Purge { video_id: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tube_harvest=info,harvest=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn open_pipeline(settings: &HarvestSettings) -> Result<IngestPipeline> {
    let client = DataApiClient::new(settings)?;
    let store = open_store(settings).await?;
    Ok(IngestPipeline::new(
        Gateway::new(Arc::new(client)),
        store,
        settings.concurrency,
    ))
}

async fn open_store(settings: &HarvestSettings) -> Result<MetadataStore> {
    MetadataStore::open(&settings.database_path, settings.pool_size)
        .await
        .with_context(|| {
            format!(
                "initializing metadata database {}",
                settings.database_path.display()
            )
        })
}

async fn ingest(pipeline: &IngestPipeline, ids: Vec<String>) -> Result<()> {
    let report = pipeline
        .process_many(ids, |outcome| println!("{}", outcome.log_line()))
        .await;
    println!("{}", report.summary());
    if report.succeeded < report.total {
        bail!(
            "{} of {} videos failed",
            report.total - report.succeeded,
            report.total
        );
    }
    Ok(())
}

async fn search(pipeline: &IngestPipeline, args: &SearchArgs) -> Result<Vec<String>> {
    match pipeline.search(&args.to_params()).await? {
        Some(ids) => Ok(ids),
        None => bail!("video search failed"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let Cli {
        env_file,
        database,
        concurrency,
        command,
    } = Cli::parse();
    init_tracing();

    let settings = resolve_settings(SettingsOverrides {
        api_key: None,
        database_path: database,
        concurrency,
        env_path: env_file,
    })?;

    match command {
        Command::Search(args) => {
            let pipeline = open_pipeline(&settings).await?;
            for id in search(&pipeline, &args).await? {
                println!("{id}");
            }
        }
        Command::Ingest { videos } => {
            let pipeline = open_pipeline(&settings).await?;
            ingest(&pipeline, videos).await?;
        }
        Command::Harvest(args) => {
            let pipeline = open_pipeline(&settings).await?;
            let ids = search(&pipeline, &args).await?;
            println!("Videos found: {}", ids.len());
            if ids.is_empty() {
                return Ok(());
            }
            ingest(&pipeline, ids).await?;
        }
        Command::Shell => {
            let pipeline = open_pipeline(&settings).await?;
            let (log, lines) = LogSink::channel();
            let view = spawn_log_view(lines, io::stdout())?;
            let shell = Shell::new(pipeline, log)?;
            shell.verify_credentials()?;
            println!("Commands: search, process, video, status, help, quit");
            shell.run(io::stdin().lock(), io::stderr())?;
            view.join()
                .map_err(|_| anyhow::anyhow!("log view thread panicked"))?;
        }
        Command::Stats => {
            let counts = open_store(&settings).await?.reader().counts().await?;
            println!("channels: {}", counts.channels);
            println!("videos:   {}", counts.videos);
            println!("comments: {}", counts.comments);
        }
        Command::Purge { video_id } => {
            let store = open_store(&settings).await?;
            if store.delete_video(&video_id).await? {
                println!("Deleted video {video_id} and its comments");
            } else {
                bail!("video {video_id} is not stored");
            }
        }
    }

    Ok(())
}
