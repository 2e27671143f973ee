//! DICOM to NIfTI conversion
//!
//! Each resolved DICOM series folder becomes
//! `{subject}_{view}_{sequence}[_{n}].nii.gz` in the output folder. The view
//! comes from the orientation of the series' first file. DWI images with a
//! matching ADC are resampled onto the ADC grid (first volume only for 4-D
//! series); the original and its sidecar files are kept as `_DWI_old`.

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::toolkit::Interpolation;
use neuroprep_common::naming::{self, View};
use neuroprep_common::session::list_entry_names;
use neuroprep_common::{Sequence, SessionInfo};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub(crate) async fn run(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let entries = list_entry_names(&session.session_folder)?;
    let resolved = pipeline.config().sequences.resolve(&entries);

    tokio::fs::create_dir_all(&session.output_folder).await?;

    let mut converted = 0usize;
    let mut failed = 0usize;

    for (sequence, names) in resolved.iter() {
        for name in names {
            if is_excluded(pipeline, sequence, name) {
                info!(series = %name, "Skipping excluded {} series", sequence);
                continue;
            }

            let series = session.session_folder.join(name);
            if !series.is_dir() {
                debug!(entry = %name, "Not a DICOM series folder, skipping");
                continue;
            }

            match convert_series(pipeline, session, &series, sequence).await {
                Ok(output) => {
                    info!(series = %name, output = %output.display(), "Converted");
                    converted += 1;
                }
                Err(e) => {
                    error!(series = %name, "Conversion failed: {}", e);
                    failed += 1;
                }
            }
        }
    }

    conform_dwi_to_adc(pipeline, session).await?;

    info!(converted, failed, "Conversion finished");
    Ok(())
}

fn is_excluded(pipeline: &Pipeline, sequence: Sequence, name: &str) -> bool {
    if sequence != Sequence::T1 {
        return false;
    }
    let upper = name.to_ascii_uppercase();
    pipeline
        .config()
        .conversion
        .t1_exclusions
        .iter()
        .any(|x| upper.contains(&x.to_ascii_uppercase()))
}

/// View of a series from its first file; unknown when it cannot be probed
async fn probe_view(pipeline: &Pipeline, series: &Path) -> View {
    let first = match list_entry_names(series) {
        Ok(names) => names.into_iter().next(),
        Err(e) => {
            warn!(series = %series.display(), "Cannot list series: {}", e);
            None
        }
    };
    let Some(first) = first else {
        return View::Unknown;
    };

    let command = pipeline.toolkit().probe_orientation(&series.join(first));
    match pipeline.runner().run(&command).await {
        Ok(output) if output.success() => View::from_probe_output(&output.stdout),
        Ok(output) => {
            warn!(series = %series.display(), exit_code = output.exit_code, "Orientation probe failed");
            View::Unknown
        }
        Err(e) => {
            warn!(series = %series.display(), "Orientation probe failed: {}", e);
            View::Unknown
        }
    }
}

async fn convert_series(
    pipeline: &Pipeline,
    session: &SessionInfo,
    series: &Path,
    sequence: Sequence,
) -> Result<PathBuf, StageError> {
    let view = probe_view(pipeline, series).await;
    let stem = naming::raw_stem(&session.subject, view, sequence);
    let output = naming::next_free_nifti(&session.output_folder, &stem);

    let file_name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = naming::nifti_stem(&file_name);

    pipeline
        .runner()
        .run_checked(&pipeline.toolkit().convert_dicom(name, &session.output_folder, series))
        .await?;

    if let Some(command) = pipeline.toolkit().reorient(&output) {
        let result = pipeline.runner().run(&command).await?;
        if !result.success() || !result.stderr.trim().is_empty() {
            error!(
                file = %output.display(),
                exit_code = result.exit_code,
                "Reorientation failed: {}",
                result.stderr.trim()
            );
        }
    }

    Ok(output)
}

/// Converted DWI images (`..._DWI[_n].nii.gz`, not already set aside)
fn dwi_images(subject: &str, entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter(|name| {
            naming::RawNifti::parse(subject, name).is_some_and(|raw| raw.sequence == Sequence::DWI)
        })
        .cloned()
        .collect()
}

async fn conform_dwi_to_adc(pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
    let entries = list_entry_names(&session.output_folder)?;

    for dwi in dwi_images(&session.subject, &entries) {
        let adc = dwi.replacen("_DWI", "_ADC", 1);
        if !entries.contains(&adc) {
            continue;
        }

        set_aside_dwi(&session.output_folder, &dwi, &entries).await?;

        info!(dwi = %dwi, adc = %adc, "Resampling DWI onto ADC grid");
        if let Err(e) = conform_dwi(pipeline, &session.output_folder, &dwi, &adc).await {
            warn!(dwi = %dwi, "DWI resampling failed: {}", e);
        }
    }

    Ok(())
}

fn old_dwi_name(name: &str) -> String {
    name.replacen("_DWI", "_DWI_old", 1)
}

/// Rename the DWI image and its sidecars (`.json`, `.bval`, ...) to `_DWI_old`
///
/// Files already set aside by a previous run are left alone.
async fn set_aside_dwi(dir: &Path, dwi: &str, entries: &[String]) -> Result<(), StageError> {
    let sidecar_prefix = format!("{}.", naming::nifti_stem(dwi));

    for name in entries.iter().filter(|n| n.starts_with(&sidecar_prefix)) {
        let old = dir.join(old_dwi_name(name));
        if old.exists() {
            continue;
        }
        debug!(file = %name, "Setting original DWI file aside");
        tokio::fs::rename(dir.join(name), &old).await?;
    }
    Ok(())
}

/// Resample the set-aside DWI onto the ADC grid, first volume only
async fn conform_dwi(pipeline: &Pipeline, dir: &Path, dwi: &str, adc: &str) -> Result<(), StageError> {
    let runner = pipeline.runner();
    let toolkit = pipeline.toolkit();
    let old_name = old_dwi_name(dwi);
    let old_path = dir.join(&old_name);

    let probe = runner.run_checked(&toolkit.volume_count(&old_path)).await?;
    let volumes = probe.stdout.trim().parse::<u32>().map_err(|_| {
        StageError::MissingArtifact(format!(
            "cannot read volume count of {}: {:?}",
            old_path.display(),
            probe.stdout.trim()
        ))
    })?;

    let first_volume = dir.join(format!("{}_vol0{}", naming::nifti_stem(&old_name), naming::NIFTI_EXT));
    let source = if volumes > 1 {
        runner.run_checked(&toolkit.first_volume(&old_path, &first_volume)).await?;
        first_volume.clone()
    } else {
        old_path
    };

    let command = toolkit.conform(&source, &dir.join(adc), &dir.join(dwi), Interpolation::Linear);
    let result = runner.run_checked(&command).await;

    if source == first_volume {
        if let Err(e) = tokio::fs::remove_file(&first_volume).await {
            warn!(file = %first_volume.display(), "Cannot remove temporary DWI volume: {}", e);
        }
    }
    result.map(|_| ())
}
