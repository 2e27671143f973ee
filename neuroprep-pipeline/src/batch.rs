//! Batch driver: one worker process per session
//!
//! # Flow
//! 1. Discover subjects and their sessions under the root folder and create
//!    every output folder.
//! 2. If the step contributes to the heatmap, reset this run's heatmap.
//! 3. Launch `neuroprep run --session <json> --step <step>` per session,
//!    at most `jobs` at a time, and wait for all of them.
//! 4. If the step contributes to the heatmap, threshold it.
//!
//! Workers share nothing but the heatmap files, which they only touch under
//! the ledger lock. A failed worker is reported and never stops the batch.

use crate::heatmap::{self, HeatmapArtifacts, ThresholdSummary};
use crate::pipeline::Pipeline;
use crate::stages::Step;
use crate::tools::ToolCommand;
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use neuroprep_common::session::{discover_sessions, discover_subjects};
use neuroprep_common::SessionInfo;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// How to start one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub config: Option<PathBuf>,
}

impl WorkerCommand {
    /// Workers are this same executable
    pub fn current_exe(config: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate the neuroprep executable")?;
        Ok(Self {
            program: exe.to_string_lossy().to_string(),
            config,
        })
    }

    pub fn for_session(&self, session: &SessionInfo, step: Step, run_id: &str) -> Result<ToolCommand> {
        let mut command = ToolCommand::new(self.program.clone())
            .arg("run")
            .arg("--session")
            .arg(session.to_json()?)
            .arg("--step")
            .arg(step.name())
            .arg("--run-id")
            .arg(run_id);

        if let Some(config) = &self.config {
            command = command.arg("--config").path_arg(config);
        }
        Ok(command)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub root: PathBuf,
    pub output_root: PathBuf,
    pub subject_file: Option<PathBuf>,
    pub step: Step,
    /// Maximum concurrent workers
    pub jobs: usize,
    pub worker: WorkerCommand,
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub sessions: usize,
    /// `subject/session` of workers that exited non-zero or did not start
    pub failed: Vec<String>,
    pub threshold: Option<ThresholdSummary>,
}

/// Sessions under `root`, with output folders created
pub fn prepare_sessions(options: &BatchOptions) -> Result<Vec<SessionInfo>> {
    let subjects = discover_subjects(&options.root, options.subject_file.as_deref())
        .with_context(|| format!("Cannot list subjects in {}", options.root.display()))?;
    let sessions = discover_sessions(&options.root, &options.output_root, &subjects)
        .context("Cannot list sessions")?;

    for session in &sessions {
        std::fs::create_dir_all(&session.output_folder).with_context(|| {
            format!("Cannot create output folder {}", session.output_folder.display())
        })?;
    }

    info!(subjects = subjects.len(), sessions = sessions.len(), "Sessions discovered");
    Ok(sessions)
}

/// Re-emit a worker's log lines under the batch's subscriber
///
/// Workers exit 0 even when stages fail, so their log output is the only
/// place stage errors show up. Each line keeps its original text and is
/// re-logged at the level it names.
fn forward_worker_log(label: &str, stderr: &str) {
    for line in stderr.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()) {
        if line.contains("ERROR") {
            error!(session = %label, "{}", line);
        } else if line.contains("WARN") {
            warn!(session = %label, "{}", line);
        } else {
            info!(session = %label, "{}", line);
        }
    }
}

pub async fn run_batch(pipeline: &Pipeline, options: &BatchOptions) -> Result<BatchSummary> {
    let sessions = prepare_sessions(options)?;
    let artifacts = HeatmapArtifacts::new(&options.output_root, pipeline.run_id());
    let aggregates = options.step.aggregates();

    if aggregates {
        let removed = heatmap::reset(&artifacts).await?;
        info!(removed = removed.len(), run_id = pipeline.run_id(), "Heatmap reset");
    }

    let mut commands = Vec::with_capacity(sessions.len());
    for session in &sessions {
        let command = options.worker.for_session(session, options.step, pipeline.run_id())?;
        commands.push((format!("{}/{}", session.subject, session.session), command));
    }

    let jobs = options.jobs.max(1);
    info!(step = options.step.name(), workers = commands.len(), jobs, "Launching workers");

    let runner = pipeline.runner();
    let failed: Vec<String> = stream::iter(commands)
        .map(|(label, command)| async move {
            match runner.run(&command).await {
                Ok(output) if output.success() => {
                    forward_worker_log(&label, &output.stderr);
                    info!(session = %label, "Worker finished");
                    None
                }
                Ok(output) => {
                    forward_worker_log(&label, &output.stderr);
                    error!(session = %label, exit_code = output.exit_code, "Worker failed");
                    Some(label)
                }
                Err(e) => {
                    error!(session = %label, "Worker could not start: {}", e);
                    Some(label)
                }
            }
        })
        .buffer_unordered(jobs)
        .filter_map(|label| async move { label })
        .collect()
        .await;

    let threshold = if aggregates {
        heatmap::threshold(
            pipeline.runner(),
            pipeline.toolkit(),
            &artifacts,
            &pipeline.lock_policy(),
            pipeline.config().heatmap.threshold_fraction,
        )
        .await?
    } else {
        None
    };

    if !failed.is_empty() {
        warn!(failed = failed.len(), "Some workers failed");
    }

    Ok(BatchSummary {
        sessions: sessions.len(),
        failed,
        threshold,
    })
}
