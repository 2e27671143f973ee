//! Registration of every converted image onto the structural target brain

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::selection::{require_mask, require_target};
use crate::state::SessionState;
use neuroprep_common::naming::{self, View};
use neuroprep_common::SessionInfo;
use tracing::{info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let outputs = SessionState::read(subject, &session.output_folder)?;

    let target = require_target(&outputs, "register to")?.sequence;
    let target_name = naming::axial_nifti(subject, target);
    let target_file = outputs.axial(target).ok_or_else(|| {
        StageError::MissingArtifact(format!("{} not found in {}", target_name, outputs.dir().display()))
    })?;
    let mask = require_mask(&outputs, target, "registration")?;

    let target_brain = session.output_folder.join(naming::brain_nifti(&target_name));
    pipeline
        .runner()
        .run_checked(&pipeline.toolkit().apply_mask(&target_file, &mask.file, &target_brain))
        .await?;

    let inputs = SessionState::read(subject, &session.session_folder)?;
    let moving: Vec<_> = inputs
        .raw_niftis()
        .into_iter()
        .filter(|(name, raw)| raw.view == View::Axial && *name != target_name)
        .collect();

    info!(target = %target, images = moving.len(), "Registering session images");

    let mut failed = 0usize;
    for (name, raw) in &moving {
        let result = super::register(
            pipeline,
            subject,
            &session.output_folder,
            &target_brain,
            &inputs.path(name),
            &raw.label,
            target.as_str(),
        )
        .await;

        if let Err(e) = result {
            warn!(file = %name, "Registration failed: {}", e);
            failed += 1;
        }
    }

    info!(registered = moving.len() - failed, failed, "Registration finished");
    Ok(())
}
