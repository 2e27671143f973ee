//! Population lesion heatmap
//!
//! Every subject's template-space lesion segmentation is added voxelwise
//! into one accumulator image shared by all workers of a run. A ledger
//! lists the contributing subjects, one line per accumulation, and is the
//! denominator for the final threshold.
//!
//! # Concurrency
//! Workers are separate processes. The read-modify-write of accumulator and
//! ledger happens only while holding [`lock::LockGuard`] on the ledger, so
//! two contributions can never interleave and the ledger line count always
//! equals the number of contributions summed into the accumulator.
//!
//! # Artifacts (per run id, under the output root)
//! - `lesion_heatmap_{run_id}.nii.gz`: accumulator
//! - `lesion_heatmap_{run_id}_names.txt`: ledger
//! - `lesion_heatmap_{run_id}_thr.nii.gz`: thresholded map
//! - `lesion_heatmap_{run_id}_names.txt.lock`: lock file

pub mod ledger;
pub mod lock;

use crate::error::StageError;
use crate::heatmap::ledger::Ledger;
use crate::heatmap::lock::{LockGuard, LockPolicy};
use crate::toolkit::Toolkit;
use crate::tools::ToolRunner;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Run id used when none is given: today's date, `yy-mm-dd`
pub fn default_run_id() -> String {
    chrono::Local::now().format("%y-%m-%d").to_string()
}

/// File locations for one run's heatmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeatmapArtifacts {
    pub accumulator: PathBuf,
    pub ledger: PathBuf,
    pub thresholded: PathBuf,
    pub lock: PathBuf,
}

impl HeatmapArtifacts {
    pub fn new(output_root: &Path, run_id: &str) -> Self {
        let base = format!("lesion_heatmap_{}", run_id);
        let ledger = output_root.join(format!("{}_names.txt", base));
        let lock = output_root.join(format!("{}_names.txt.lock", base));

        Self {
            accumulator: output_root.join(format!("{}.nii.gz", base)),
            thresholded: output_root.join(format!("{}_thr.nii.gz", base)),
            ledger,
            lock,
        }
    }

    fn staging(&self) -> PathBuf {
        let name = self
            .accumulator
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.accumulator.with_file_name(format!(".{}.partial", name))
    }

    /// Accumulator as it was before the contribution in progress
    fn previous(&self) -> PathBuf {
        let name = self
            .accumulator
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.accumulator.with_file_name(format!(".{}.previous", name))
    }
}

/// Outcome of one accumulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contribution {
    /// This subject created the accumulator
    pub first: bool,
    /// Ledger entries after this contribution
    pub contributions: usize,
}

/// Add `segmentation` into the accumulator and record `subject`
///
/// The first contributor copies its segmentation as the accumulator and
/// starts a fresh ledger; later ones add voxelwise. The ledger line is
/// written only after the accumulator update succeeded, and the accumulator
/// is rolled back if either step fails.
pub async fn contribute(
    runner: &dyn ToolRunner,
    toolkit: &Toolkit,
    artifacts: &HeatmapArtifacts,
    policy: &LockPolicy,
    subject: &str,
    segmentation: &Path,
) -> Result<Contribution, StageError> {
    let guard = LockGuard::acquire(&artifacts.lock, policy).await?;
    let ledger = Ledger::new(&artifacts.ledger);

    let first = !tokio::fs::try_exists(&artifacts.accumulator).await?;
    let previous = artifacts.previous();
    if first {
        info!(subject, "First segmentation, creating lesion map");
        let staging = artifacts.staging();
        tokio::fs::copy(segmentation, &staging).await?;
        ledger.reset()?;
        tokio::fs::rename(&staging, &artifacts.accumulator).await?;
    } else {
        info!(subject, "Adding segmentation to lesion map");
        tokio::fs::copy(&artifacts.accumulator, &previous).await?;
        let added = runner
            .run_checked(&toolkit.add(&artifacts.accumulator, segmentation, &artifacts.accumulator))
            .await;
        if let Err(e) = added {
            tokio::fs::rename(&previous, &artifacts.accumulator).await?;
            return Err(e);
        }
    }

    if let Err(e) = ledger.append(subject) {
        error!(subject, "Ledger update failed, rolling back lesion map: {}", e);
        if first {
            tokio::fs::remove_file(&artifacts.accumulator).await?;
        } else {
            tokio::fs::rename(&previous, &artifacts.accumulator).await?;
        }
        return Err(e.into());
    }
    if !first {
        tokio::fs::remove_file(&previous).await?;
    }

    let contributions = ledger.count()?;
    guard.release()?;

    Ok(Contribution {
        first,
        contributions,
    })
}

/// Minimum voxel value kept by [`threshold`]: `floor(contributions * fraction)`
pub fn threshold_for(contributions: usize, fraction: f64) -> u64 {
    (contributions as f64 * fraction).floor() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdSummary {
    pub contributions: usize,
    pub threshold: u64,
    pub output: PathBuf,
}

/// Zero every accumulator voxel below [`threshold_for`] into the
/// thresholded map
///
/// Returns `None` (and writes nothing) when nobody contributed.
pub async fn threshold(
    runner: &dyn ToolRunner,
    toolkit: &Toolkit,
    artifacts: &HeatmapArtifacts,
    policy: &LockPolicy,
    fraction: f64,
) -> Result<Option<ThresholdSummary>, StageError> {
    let guard = LockGuard::acquire(&artifacts.lock, policy).await?;

    let contributions = Ledger::new(&artifacts.ledger).count()?;
    if contributions == 0 || !tokio::fs::try_exists(&artifacts.accumulator).await? {
        warn!(
            ledger = %artifacts.ledger.display(),
            "No lesion map contributions, nothing to threshold"
        );
        guard.release()?;
        return Ok(None);
    }

    let thr = threshold_for(contributions, fraction);
    info!(contributions, threshold = thr, "Thresholding lesion map");

    runner
        .run_checked(&toolkit.threshold(&artifacts.accumulator, thr, &artifacts.thresholded))
        .await?;
    guard.release()?;

    Ok(Some(ThresholdSummary {
        contributions,
        threshold: thr,
        output: artifacts.thresholded.clone(),
    }))
}

/// Delete every artifact of a run, lock file included
///
/// Must not run while workers of the same run are contributing.
pub async fn reset(artifacts: &HeatmapArtifacts) -> Result<Vec<PathBuf>, StageError> {
    let mut removed = Vec::new();

    for path in [
        &artifacts.accumulator,
        &artifacts.thresholded,
        &artifacts.lock,
        &artifacts.ledger,
    ] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(file = %path.display(), "Removed previous heatmap artifact");
                removed.push(path.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(removed)
}
