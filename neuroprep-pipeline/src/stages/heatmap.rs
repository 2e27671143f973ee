//! Heatmap contribution of one subject's template-space lesion

use crate::error::StageError;
use crate::heatmap::{self, HeatmapArtifacts};
use crate::pipeline::Pipeline;
use crate::state::SessionState;
use neuroprep_common::SessionInfo;
use tracing::{info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let lesions = state.template_segmentations();
    let Some(lesion) = lesions.first().copied() else {
        return Err(StageError::MissingArtifact(format!(
            "No template-space lesion segmentation for subject {}",
            subject
        )));
    };
    if lesions.len() > 1 {
        warn!(candidates = ?lesions, chosen = lesion, "Several lesion files found, using the first");
    }

    let artifacts = HeatmapArtifacts::new(&session.output_root, pipeline.run_id());
    let contribution = heatmap::contribute(
        pipeline.runner(),
        pipeline.toolkit(),
        &artifacts,
        &pipeline.lock_policy(),
        subject,
        &state.path(lesion),
    )
    .await?;

    info!(
        first = contribution.first,
        contributions = contribution.contributions,
        "Lesion added to heatmap"
    );
    Ok(())
}
