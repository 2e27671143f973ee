//! neuroprep - MRI preprocessing pipeline
//!
//! Runs preprocessing stages for one session (`run`), fans a step out over
//! every session under a root folder (`batch`), and manages the population
//! lesion heatmap (`heatmap-reset`, `heatmap-threshold`).

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use neuroprep_common::{PipelineConfig, SessionInfo};
use neuroprep_pipeline::batch::{self, BatchOptions, WorkerCommand};
use neuroprep_pipeline::heatmap::{self, HeatmapArtifacts};
use neuroprep_pipeline::{logging, Pipeline, Step};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Command-line arguments for neuroprep
#[derive(Parser, Debug)]
#[command(name = "neuroprep")]
#[command(about = "Preprocessing toolkit for MRI sessions")]
#[command(version)]
struct Args {
    /// Configuration file (overrides NEUROPREP_CONFIG and the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a step for one session
    Run {
        /// Session description as JSON, or @path to a file holding it
        #[arg(long)]
        session: String,

        /// Stage or macro stage name
        #[arg(short, long)]
        step: String,

        /// Heatmap run id (default: today, yy-mm-dd)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Run a step for every session under a root folder
    Batch {
        /// Folder holding one sub-folder per subject
        #[arg(short, long)]
        root: PathBuf,

        /// Stage or macro stage name
        #[arg(short, long)]
        step: String,

        /// Output root (default: the root folder)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Text file listing the subjects to process, one per line
        #[arg(short = 'f', long)]
        subject_file: Option<PathBuf>,

        /// Maximum concurrent worker processes
        #[arg(short, long, default_value = "4")]
        jobs: usize,

        /// Heatmap run id (default: today, yy-mm-dd)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Delete a run's heatmap, ledger and lock
    HeatmapReset {
        #[arg(long)]
        output_root: PathBuf,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// Threshold a run's heatmap by its contributor count
    HeatmapThreshold {
        #[arg(long)]
        output_root: PathBuf,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// List stage and macro stage names
    Steps,
}

fn parse_step(name: &str) -> Result<Step> {
    Step::from_name(name).ok_or_else(|| {
        anyhow!(
            "Step {} does not exist; known steps: {}",
            name,
            Step::names().join(", ")
        )
    })
}

fn read_session(arg: &str) -> Result<SessionInfo> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(Path::new(path))
            .with_context(|| format!("Cannot read session file {}", path))?,
        None => arg.to_string(),
    };
    SessionInfo::from_json(&text).context("Invalid session description")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::Steps = args.command {
        for name in Step::names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let (config, source) =
        PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    logging::init(&config.logging)?;
    info!(source = ?source, "Configuration loaded");

    let config = Arc::new(config);
    let run_id_or_today = |id: Option<String>| id.unwrap_or_else(heatmap::default_run_id);

    match args.command {
        Command::Run { session, step, run_id } => {
            let step = parse_step(&step)?;
            let session = read_session(&session)?;
            let pipeline = Pipeline::with_system_tools(config, run_id_or_today(run_id));

            let report = pipeline.run_step(step, session).await;
            info!(
                step = step.name(),
                failed = report.failures().count(),
                "Worker done"
            );
        }

        Command::Batch {
            root,
            step,
            output_dir,
            subject_file,
            jobs,
            run_id,
        } => {
            let step = parse_step(&step)?;
            let output_root = output_dir.unwrap_or_else(|| root.clone());
            let pipeline = Pipeline::with_system_tools(config, run_id_or_today(run_id));

            let options = BatchOptions {
                root,
                output_root,
                subject_file,
                step,
                jobs,
                worker: WorkerCommand::current_exe(args.config.clone())?,
            };
            let summary = batch::run_batch(&pipeline, &options).await?;

            info!(
                sessions = summary.sessions,
                failed = summary.failed.len(),
                "Batch done"
            );
            if let Some(thr) = &summary.threshold {
                info!(
                    contributions = thr.contributions,
                    threshold = thr.threshold,
                    output = %thr.output.display(),
                    "Heatmap thresholded"
                );
            }
            if !summary.failed.is_empty() {
                bail!("{} worker(s) failed: {}", summary.failed.len(), summary.failed.join(", "));
            }
        }

        Command::HeatmapReset { output_root, run_id } => {
            let artifacts = HeatmapArtifacts::new(&output_root, &run_id_or_today(run_id));
            let removed = heatmap::reset(&artifacts).await?;
            info!(removed = removed.len(), "Heatmap reset");
        }

        Command::HeatmapThreshold { output_root, run_id } => {
            let pipeline = Pipeline::with_system_tools(config.clone(), run_id_or_today(run_id));
            let artifacts = HeatmapArtifacts::new(&output_root, pipeline.run_id());
            let summary = heatmap::threshold(
                pipeline.runner(),
                pipeline.toolkit(),
                &artifacts,
                &pipeline.lock_policy(),
                config.heatmap.threshold_fraction,
            )
            .await?;

            match summary {
                Some(thr) => info!(
                    contributions = thr.contributions,
                    threshold = thr.threshold,
                    output = %thr.output.display(),
                    "Heatmap thresholded"
                ),
                None => info!("Nothing to threshold"),
            }
        }

        Command::Steps => {}
    }

    Ok(())
}
