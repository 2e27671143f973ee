//! Brain mask prediction for the structural target

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::predict::PredictionRequest;
use crate::selection::{require_mask, require_target};
use crate::state::SessionState;
use neuroprep_common::naming::{self, View};
use neuroprep_common::SessionInfo;
use tracing::info;

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let target = require_target(&state, "create a brain mask for")?.sequence;
    let target_name = naming::axial_nifti(subject, target);
    let target_file = state.axial(target).ok_or_else(|| {
        StageError::MissingArtifact(format!("{} not found in {}", target_name, state.dir().display()))
    })?;

    tokio::fs::create_dir_all(&session.output_folder).await?;
    let mask = session
        .output_folder
        .join(naming::mask_nifti(subject, View::Axial, target));

    info!(target = %target, mask = %mask.display(), "Predicting brain mask");
    pipeline
        .predictor()
        .predict(&PredictionRequest::brain_mask(target, target_file.clone(), mask))
        .await?;

    // An edited mask already in the folder still takes precedence
    let outputs = SessionState::read(subject, &session.output_folder)?;
    let chosen = require_mask(&outputs, target, "skull stripping")?;

    let brain = session.session_folder.join(naming::brain_nifti(&target_name));
    pipeline
        .runner()
        .run_checked(&pipeline.toolkit().apply_mask(&target_file, &chosen.file, &brain))
        .await?;

    info!(brain = %brain.display(), "Brain image written");
    Ok(())
}
