//! Stroke lesion segmentation
//!
//! Needs ADC plus b1000 (preferred) or DWI. The predicted segmentation is
//! carried into target space with the transform the diffusion image got
//! during registration.

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::predict::PredictionRequest;
use crate::selection::require_target;
use crate::state::SessionState;
use crate::toolkit::Interpolation;
use neuroprep_common::naming;
use neuroprep_common::{Sequence, SessionInfo};
use tracing::info;

/// Label of the segmentation in file names
pub const SEGMENTATION_LABEL: &str = "stroke_segmentation";

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let adc = state.axial(Sequence::ADC);
    let b1000 = state.axial(Sequence::B1000);
    let dwi = state.axial(Sequence::DWI);

    let (Some(adc), Some((diffusion, diffusion_seq))) = (
        adc,
        b1000
            .map(|p| (p, Sequence::B1000))
            .or_else(|| dwi.map(|p| (p, Sequence::DWI))),
    ) else {
        return Err(StageError::MissingModality(format!(
            "Subject {} lacks ADC plus b1000 or DWI for stroke segmentation",
            subject
        )));
    };
    let target = require_target(&state, "carry the stroke segmentation to")?.sequence;

    tokio::fs::create_dir_all(&session.output_folder).await?;
    let segmentation = session
        .output_folder
        .join(format!("{}_{}{}", subject, SEGMENTATION_LABEL, naming::NIFTI_EXT));

    info!(input = %diffusion_seq, "Segmenting stroke");
    pipeline
        .predictor()
        .predict(&PredictionRequest::stroke(
            diffusion_seq == Sequence::DWI,
            diffusion,
            adc,
            segmentation.clone(),
        ))
        .await?;

    let moving = diffusion_seq.as_str();
    let transform = session
        .output_folder
        .join(naming::affine_transform(subject, moving, target.as_str()));
    let registered = session
        .output_folder
        .join(naming::warped_nifti(subject, moving, target.as_str()));

    for required in [&transform, &registered] {
        if !required.exists() {
            return Err(StageError::MissingArtifact(format!(
                "{} needed to move the segmentation to {} space; run registration first",
                required.display(),
                target
            )));
        }
    }

    let output = session
        .output_folder
        .join(naming::warped_nifti(subject, SEGMENTATION_LABEL, target.as_str()));
    pipeline
        .runner()
        .run_checked(&pipeline.toolkit().apply_transform(
            &segmentation,
            &registered,
            &output,
            &transform,
            Interpolation::NearestNeighbour,
        ))
        .await?;

    info!(output = %output.display(), "Stroke segmentation in target space");
    Ok(())
}
