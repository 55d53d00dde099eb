//! Line-oriented interactive shell.
//!
//! Input is read on the calling thread. Searches and ingests run as jobs on a
//! worker thread that owns a single-threaded runtime, and every status line
//! goes through a [`LogSink`] to the log view, which prints it with a
//! timestamp.

use std::future::Future;
use std::io::{BufRead, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use chrono::{Local, NaiveTime};
use clap::{Args, Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc as job_channel;
use tokio::task::JoinSet;
use tracing::warn;

use crate::pipeline::{IngestPipeline, PipelineState};
use crate::youtube::{SearchParams, VideoDuration};

/// Search flags shared by the shell and the one-shot CLI.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct SearchArgs {
    /// Words to search for.
    #[arg(required = true, num_args = 1..)]
    pub query: Vec<String>,

    /// How many video ids to collect.
    #[arg(long = "max", default_value_t = 42, allow_negative_numbers = true)]
    pub max_results: i64,

    /// Numeric videoCategoryId (1-44).
    #[arg(long, default_value = "1")]
    pub category: String,

    /// Only videos published on or after this date (YYYY-MM-DD).
    #[arg(long, default_value = "2005-02-14")]
    pub after: String,

    /// Only videos published before this date (YYYY-MM-DD).
    #[arg(long, default_value = "2025-01-01")]
    pub before: String,

    #[arg(long, value_enum, default_value = "medium")]
    pub duration: VideoDuration,
}

impl SearchArgs {
    pub fn to_params(&self) -> SearchParams {
        SearchParams {
            query: self.query.join(" "),
            max_results: self.max_results,
            category: self.category.clone(),
            published_after: self.after.clone(),
            published_before: self.before.clone(),
            duration: self.duration,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "", no_binary_name = true, disable_version_flag = true)]
struct ShellLine {
    #[command(subcommand)]
    command: ShellCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    /// Searches for videos and remembers the ids found.
    Search(SearchArgs),

    /// Ingests every video from the last search.
    Process,

    /// Ingests a single video given its id or URL.
    Video { target: String },

    /// Shows what the pipeline is doing.
    Status,

    /// Leaves the shell once running jobs are done.
    #[command(alias = "exit")]
    Quit,
}

/// `Ok(None)` for a blank line. Usage errors and help text come back as
/// `Err` with the text clap rendered.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    ShellLine::try_parse_from(words)
        .map(|parsed| Some(parsed.command))
        .map_err(|err| err.render().to_string().trim_end().to_string())
}

pub fn format_log_line(time: NaiveTime, message: &str) -> String {
    format!("{} - {message}", time.format("%H:%M:%S"))
}

/// Sending half of the log view. Cheap to clone into jobs.
#[derive(Clone)]
pub struct LogSink {
    lines: mpsc::Sender<String>,
}

impl LogSink {
    pub fn channel() -> (Self, mpsc::Receiver<String>) {
        let (lines, receiver) = mpsc::channel();
        (Self { lines }, receiver)
    }

    pub fn log(&self, message: impl AsRef<str>) {
        let line = format_log_line(Local::now().time(), message.as_ref());
        // The view only goes away during shutdown.
        let _ = self.lines.send(line);
    }
}

/// Prints log lines until every [`LogSink`] is gone.
pub fn spawn_log_view<W>(lines: mpsc::Receiver<String>, mut out: W) -> Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("harvest-log".into())
        .spawn(move || {
            for line in lines {
                if writeln!(out, "{line}").and_then(|_| out.flush()).is_err() {
                    break;
                }
            }
        })
        .context("starting log view thread")
}

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Background context for shell jobs: one OS thread running a
/// current-thread runtime. Jobs run as tasks, so a long ingest does not hold
/// up a search submitted after it.
pub struct Worker {
    jobs: job_channel::UnboundedSender<Job>,
    thread: JoinHandle<()>,
}

impl Worker {
    pub fn spawn() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building worker runtime")?;
        let (jobs, mut incoming) = job_channel::unbounded_channel::<Job>();

        let thread = thread::Builder::new()
            .name("harvest-worker".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut running = JoinSet::new();
                    while let Some(job) = incoming.recv().await {
                        running.spawn(job);
                        while let Some(finished) = running.try_join_next() {
                            report_join(finished);
                        }
                    }
                    while let Some(finished) = running.join_next().await {
                        report_join(finished);
                    }
                });
            })
            .context("starting worker thread")?;

        Ok(Self { jobs, thread })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.jobs
            .send(Box::pin(job))
            .map_err(|_| anyhow!("worker has stopped"))
    }

    /// Stops accepting jobs and waits for the running ones.
    pub fn shutdown(self) -> Result<()> {
        let Worker { jobs, thread } = self;
        drop(jobs);
        thread.join().map_err(|_| anyhow!("worker thread panicked"))
    }
}

fn report_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        warn!(error = %err, "shell job failed");
    }
}

pub enum CommandExecutionResult {
    Ok,
    Exit,
    Error(String),
}

pub struct Shell {
    pipeline: IngestPipeline,
    worker: Worker,
    log: LogSink,
    found: Arc<Mutex<Option<Vec<String>>>>,
}

pub const PROMPT: &str = "harvest> ";

impl Shell {
    pub fn new(pipeline: IngestPipeline, log: LogSink) -> Result<Self> {
        Ok(Self {
            pipeline,
            worker: Worker::spawn()?,
            log,
            found: Arc::new(Mutex::new(None)),
        })
    }

    /// Checks the API credentials in the background.
    pub fn verify_credentials(&self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let log = self.log.clone();
        self.worker.submit(async move {
            match pipeline.gateway().verify().await {
                Ok(()) => log.log("API key verified"),
                Err(err) => log.log(format!("API key check failed: {err}")),
            }
        })
    }

    pub fn execute(&self, line: &str) -> CommandExecutionResult {
        let command = match parse_command(line) {
            Ok(Some(command)) => command,
            Ok(None) => return CommandExecutionResult::Ok,
            Err(text) => return CommandExecutionResult::Error(text),
        };

        let submitted = match command {
            ShellCommand::Search(args) => self.start_search(args.to_params()),
            ShellCommand::Process => self.start_processing(),
            ShellCommand::Video { target } => self.start_single(target),
            ShellCommand::Status => {
                self.log.log(self.status_line());
                Ok(())
            }
            ShellCommand::Quit => return CommandExecutionResult::Exit,
        };

        match submitted {
            Ok(()) => CommandExecutionResult::Ok,
            Err(err) => CommandExecutionResult::Error(err.to_string()),
        }
    }

    fn start_search(&self, params: SearchParams) -> Result<()> {
        self.log.log(format!(
            "Starting video search for query: {}",
            params.query.trim()
        ));
        let pipeline = self.pipeline.clone();
        let log = self.log.clone();
        let found = self.found.clone();
        self.worker.submit(async move {
            match pipeline.search(&params).await {
                Ok(Some(ids)) => {
                    let count = ids.len();
                    *found.lock() = Some(ids);
                    log.log(format!("Videos found: {count}"));
                }
                Ok(None) => log.log("Video search failed, see the error log for details"),
                Err(err) => log.log(format!("Error: {err}")),
            }
        })
    }

    fn start_processing(&self) -> Result<()> {
        let ids = match self.found.lock().clone() {
            Some(ids) if !ids.is_empty() => ids,
            _ => {
                self.log
                    .log("No video list to process. Perform search first.");
                return Ok(());
            }
        };

        self.log.log(format!("Processing {} videos", ids.len()));
        let pipeline = self.pipeline.clone();
        let log = self.log.clone();
        self.worker.submit(async move {
            let report = pipeline
                .process_many(ids, |outcome| log.log(outcome.log_line()))
                .await;
            log.log(report.summary());
        })
    }

    fn start_single(&self, target: String) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let log = self.log.clone();
        self.worker.submit(async move {
            let outcome = pipeline.process_one(&target).await;
            log.log(outcome.log_line());
        })
    }

    fn status_line(&self) -> String {
        let found = self
            .found
            .lock()
            .as_ref()
            .map_or(0, |ids| ids.len());
        let state = match self.pipeline.state() {
            PipelineState::Idle => "idle".to_string(),
            PipelineState::Searching => "searching".to_string(),
            PipelineState::Processing { total, completed } => {
                format!("processing {completed}/{total}")
            }
            PipelineState::Done { succeeded, total } => {
                format!("done, {succeeded} of {total} stored")
            }
        };
        format!("Status: {state}; {found} videos in the last search")
    }

    /// Reads commands until `quit` or end of input, then waits for running
    /// jobs.
    pub fn run<R, W>(self, input: R, mut prompt: W) -> Result<()>
    where
        R: BufRead,
        W: Write,
    {
        write!(prompt, "{PROMPT}")?;
        prompt.flush()?;
        for line in input.lines() {
            let line = line.context("reading shell input")?;
            match self.execute(line.trim()) {
                CommandExecutionResult::Ok => {}
                CommandExecutionResult::Exit => break,
                CommandExecutionResult::Error(text) => writeln!(prompt, "{text}")?,
            }
            write!(prompt, "{PROMPT}")?;
            prompt.flush()?;
        }
        self.log.log("Waiting for running jobs to finish");
        self.worker.shutdown()
    }
}
