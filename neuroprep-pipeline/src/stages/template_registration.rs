//! Template-space registration
//!
//! The target brain is resampled onto the template grid and registered to
//! the T1 template (T1 target) or T2 template (T2/FL target). The resulting
//! affine then carries every registered brain and target-space segmentation
//! into template space as `{stem}_to_template_Warped.nii.gz`.

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::selection::require_target;
use crate::state::SessionState;
use crate::toolkit::Interpolation;
use neuroprep_common::naming::{self, TEMPLATE_TARGET};
use neuroprep_common::{Sequence, SessionInfo};
use tracing::{info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let target = require_target(&state, "register to the template")?.sequence;

    let brains = state.target_brains(target);
    let Some(brain) = brains.first().copied() else {
        return Err(StageError::MissingArtifact(format!(
            "No {} brain image for subject {}; run brain extraction first",
            target, subject
        )));
    };
    if brains.len() > 1 {
        warn!(candidates = ?brains, chosen = brain, "Several target brains found, using the first");
    }

    let template = match target {
        Sequence::T1 => pipeline.config().templates.t1.clone(),
        _ => pipeline.config().templates.t2.clone(),
    };
    if !template.exists() {
        return Err(StageError::MissingArtifact(format!(
            "template brain {}",
            template.display()
        )));
    }

    let runner = pipeline.runner();
    let toolkit = pipeline.toolkit();

    let resampled = session
        .session_folder
        .join(format!("{}_resampled{}", naming::nifti_stem(brain), naming::NIFTI_EXT));
    runner
        .run_checked(&toolkit.conform(&state.path(brain), &template, &resampled, Interpolation::Linear))
        .await?;

    super::register(
        pipeline,
        subject,
        &session.output_folder,
        &template,
        &resampled,
        target.as_str(),
        TEMPLATE_TARGET,
    )
    .await?;

    let affine = session
        .output_folder
        .join(naming::affine_transform(subject, target.as_str(), TEMPLATE_TARGET));
    if !affine.exists() {
        return Err(StageError::MissingArtifact(format!(
            "template transform {}",
            affine.display()
        )));
    }

    let mut moving: Vec<(&str, Interpolation)> = state
        .registered_brains()
        .into_iter()
        .map(|n| (n, Interpolation::Linear))
        .collect();
    moving.extend(
        state
            .target_space_segmentations()
            .into_iter()
            .map(|n| (n, Interpolation::NearestNeighbour)),
    );

    let mut failed = 0usize;
    for (name, interpolation) in &moving {
        let output = session.output_folder.join(naming::template_warped_nifti(name));
        let result = async {
            runner
                .run_checked(&toolkit.conform(&state.path(name), &template, &output, *interpolation))
                .await?;
            runner
                .run_checked(&toolkit.apply_transform(&output, &template, &output, &affine, *interpolation))
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(file = %name, "Template transform failed: {}", e);
            failed += 1;
        }
    }

    info!(target = %target, images = moving.len(), failed, "Template registration finished");
    Ok(())
}
