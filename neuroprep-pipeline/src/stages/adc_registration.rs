//! Registration of ADC images, preferring a T2 target

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::selection::{select_raw_target, ADC_TARGET_PRIORITY};
use crate::state::SessionState;
use neuroprep_common::{Sequence, SessionInfo};
use tracing::{info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let target = select_raw_target(&state, &ADC_TARGET_PRIORITY).ok_or_else(|| {
        StageError::MissingModality(format!(
            "Subject {} has no T2, T1 or FL to register ADC to",
            subject
        ))
    })?;
    let Some(target_file) = state.axial(target) else {
        return Err(StageError::MissingArtifact(format!("axial {} image", target)));
    };

    let adc_images: Vec<_> = state
        .raw_niftis()
        .into_iter()
        .filter(|(_, raw)| matches!(raw.sequence, Sequence::ADC | Sequence::EAdc))
        .collect();
    if adc_images.is_empty() {
        return Err(StageError::MissingModality(format!(
            "Subject {} has no ADC image",
            subject
        )));
    }

    let mut failed = 0usize;
    for (name, raw) in &adc_images {
        let result = super::register(
            pipeline,
            subject,
            &session.output_folder,
            &target_file,
            &state.path(name),
            &raw.label,
            target.as_str(),
        )
        .await;

        if let Err(e) = result {
            warn!(file = %name, "ADC registration failed: {}", e);
            failed += 1;
        }
    }

    info!(target = %target, images = adc_images.len(), failed, "ADC registration finished");
    Ok(())
}
