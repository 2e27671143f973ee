//! Skull stripping of registration outputs with the target's brain mask
//!
//! One masking invocation per registered image plus one for the target,
//! all launched before any is joined.

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::selection::{require_mask, require_target};
use crate::state::SessionState;
use crate::tools::{join_all, run_async, ToolHandle};
use neuroprep_common::naming;
use neuroprep_common::SessionInfo;
use tracing::{info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let subject = &session.subject;
    let state = SessionState::read(subject, &session.session_folder)?;

    let target = require_target(&state, "extract brains for")?.sequence;
    let mask = require_mask(&state, target, "brain extraction")?;

    let mut inputs: Vec<String> = state
        .registered_images()
        .into_iter()
        .map(str::to_string)
        .collect();
    if state.axial(target).is_some() {
        inputs.push(naming::axial_nifti(subject, target));
    }

    let handles: Vec<ToolHandle> = inputs
        .iter()
        .map(|name| {
            let output = session.output_folder.join(naming::brain_nifti(name));
            let command = pipeline
                .toolkit()
                .apply_mask(&state.path(name), &mask.file, &output);
            run_async(pipeline.shared_runner(), command)
        })
        .collect();

    let results = join_all(handles).await;

    let mut failed = 0usize;
    for (name, result) in inputs.iter().zip(results) {
        let error = match result {
            Ok(output) => output.check().err(),
            Err(e) => Some(e.into()),
        };
        if let Some(e) = error {
            warn!(file = %name, "Brain extraction failed: {}", e);
            failed += 1;
        }
    }

    info!(images = inputs.len(), failed, "Brain extraction finished");
    Ok(())
}
