//! Diffusion co-registration
//!
//! Every converted diffusion image is skull stripped and registered to the
//! structural target inside `{output}/dwiCoreg`. 4-D series are reduced to
//! their first volume first. Files are processed concurrently; one file's
//! failure does not affect the others.

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::selection::require_target;
use crate::state::SessionState;
use futures::future::join_all;
use neuroprep_common::naming::{self, RawNifti};
use neuroprep_common::SessionInfo;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Sub-folder of the output folder holding co-registration products
pub const COREG_DIR: &str = "dwiCoreg";

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let target = require_target(&state, "register diffusion images to")?.sequence;
    let target_file = state.axial(target).ok_or_else(|| {
        StageError::MissingArtifact(format!(
            "{} not found in {}",
            naming::axial_nifti(subject, target),
            state.dir().display()
        ))
    })?;

    let diffusion: Vec<(&str, RawNifti)> = state
        .raw_niftis()
        .into_iter()
        .filter(|(_, raw)| raw.sequence.is_diffusion())
        .collect();
    if diffusion.is_empty() {
        info!("No diffusion images to co-register");
        return Ok(());
    }

    let coreg_dir = session.output_folder.join(COREG_DIR);
    tokio::fs::create_dir_all(&coreg_dir).await?;

    let jobs = diffusion.iter().map(|(name, raw)| {
        coregister(
            pipeline,
            subject,
            &coreg_dir,
            &target_file,
            target.as_str(),
            state.path(name),
            raw,
        )
    });
    let results = join_all(jobs).await;

    let mut failed = 0usize;
    for ((name, _), result) in diffusion.iter().zip(results) {
        if let Err(e) = result {
            warn!(file = %name, "Diffusion co-registration failed: {}", e);
            failed += 1;
        }
    }

    info!(files = diffusion.len(), failed, "Diffusion co-registration finished");
    Ok(())
}

async fn coregister(
    pipeline: &Pipeline,
    subject: &str,
    coreg_dir: &Path,
    target_file: &Path,
    target_label: &str,
    input: PathBuf,
    raw: &RawNifti,
) -> Result<(), StageError> {
    let runner = pipeline.runner();
    let toolkit = pipeline.toolkit();
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = naming::nifti_stem(&file_name);

    let probe = runner.run_checked(&toolkit.volume_count(&input)).await?;
    let volumes = probe.stdout.trim().parse::<u32>().map_err(|_| {
        StageError::MissingArtifact(format!(
            "cannot read volume count of {}: {:?}",
            input.display(),
            probe.stdout.trim()
        ))
    })?;

    let source = if volumes > 1 {
        let first = coreg_dir.join(format!("{}_first_vol{}", stem, naming::NIFTI_EXT));
        runner.run_checked(&toolkit.first_volume(&input, &first)).await?;
        first
    } else {
        input.clone()
    };

    let brain = coreg_dir.join(naming::brain_nifti(&file_name));
    runner.run_checked(&toolkit.skull_strip(&source, &brain)).await?;

    super::register(pipeline, subject, coreg_dir, target_file, &brain, &raw.label, target_label).await?;
    Ok(())
}
