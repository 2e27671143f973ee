//! Stage registry
//!
//! Each stage has a stable command-line name and an async body taking the
//! [`Pipeline`] collaborators and one [`SessionInfo`]. Macro stages are
//! fixed stage sequences.
//!
//! | name                 | stage                    |
//! |----------------------|--------------------------|
//! | `dcm2nii`            | DICOM to NIfTI conversion|
//! | `mask`               | brain mask prediction    |
//! | `registration`       | register to target       |
//! | `dwicoreg`           | diffusion co-registration|
//! | `lesionHeatmap`      | heatmap contribution     |
//! | `brainExtraction`    | apply mask to registered |
//! | `adcRegistration`    | register ADC images      |
//! | `registerToTemplate` | move to template space   |
//! | `segmentStroke`      | stroke segmentation      |

mod adc_registration;
mod brain_extraction;
mod conversion;
pub mod dwi_coreg;
mod heatmap;
mod masking;
mod registration;
mod stroke_segmentation;
mod template_registration;

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::tools::ToolOutput;
use neuroprep_common::naming;
use neuroprep_common::SessionInfo;
use std::fmt;
use std::path::Path;
use tracing::info;

/// A single processing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Conversion,
    Masking,
    Registration,
    DwiCoregistration,
    HeatmapAggregation,
    BrainExtraction,
    AdcRegistration,
    TemplateRegistration,
    StrokeSegmentation,
}

const STAGE_NAMES: [(&str, Stage); 9] = [
    ("dcm2nii", Stage::Conversion),
    ("mask", Stage::Masking),
    ("registration", Stage::Registration),
    ("dwicoreg", Stage::DwiCoregistration),
    ("lesionHeatmap", Stage::HeatmapAggregation),
    ("brainExtraction", Stage::BrainExtraction),
    ("adcRegistration", Stage::AdcRegistration),
    ("registerToTemplate", Stage::TemplateRegistration),
    ("segmentStroke", Stage::StrokeSegmentation),
];

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Conversion,
        Stage::Masking,
        Stage::Registration,
        Stage::DwiCoregistration,
        Stage::HeatmapAggregation,
        Stage::BrainExtraction,
        Stage::AdcRegistration,
        Stage::TemplateRegistration,
        Stage::StrokeSegmentation,
    ];

    pub fn name(&self) -> &'static str {
        STAGE_NAMES
            .iter()
            .find(|(_, s)| s == self)
            .map(|(n, _)| *n)
            .unwrap_or("unknown")
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        STAGE_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
    }

    /// Stage body
    pub async fn run(self, pipeline: &Pipeline, session: &SessionInfo) -> Result<(), StageError> {
        match self {
            Stage::Conversion => conversion::run(pipeline, session).await,
            Stage::Masking => masking::run(pipeline, session).await,
            Stage::Registration => registration::run(pipeline, session).await,
            Stage::DwiCoregistration => dwi_coreg::run(pipeline, session).await,
            Stage::HeatmapAggregation => heatmap::run(pipeline, session).await,
            Stage::BrainExtraction => brain_extraction::run(pipeline, session).await,
            Stage::AdcRegistration => adc_registration::run(pipeline, session).await,
            Stage::TemplateRegistration => template_registration::run(pipeline, session).await,
            Stage::StrokeSegmentation => stroke_segmentation::run(pipeline, session).await,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Named stage sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacroStage {
    /// conversion, masking, registration
    Base,
    /// base plus brain extraction and stroke segmentation
    All,
    /// re-run everything downstream of a hand-edited mask
    FixMask,
    /// template registration and heatmap contribution
    Map,
}

impl MacroStage {
    pub const ALL: [MacroStage; 4] = [MacroStage::Base, MacroStage::All, MacroStage::FixMask, MacroStage::Map];

    pub fn name(&self) -> &'static str {
        match self {
            MacroStage::Base => "base",
            MacroStage::All => "all",
            MacroStage::FixMask => "fixMask",
            MacroStage::Map => "map",
        }
    }

    pub fn from_name(name: &str) -> Option<MacroStage> {
        MacroStage::ALL.into_iter().find(|m| m.name() == name)
    }

    pub fn stages(&self) -> &'static [Stage] {
        match self {
            MacroStage::Base => &[Stage::Conversion, Stage::Masking, Stage::Registration],
            MacroStage::All => &[
                Stage::Conversion,
                Stage::Masking,
                Stage::Registration,
                Stage::BrainExtraction,
                Stage::StrokeSegmentation,
            ],
            MacroStage::FixMask => &[
                Stage::Registration,
                Stage::BrainExtraction,
                Stage::StrokeSegmentation,
            ],
            MacroStage::Map => &[Stage::TemplateRegistration, Stage::HeatmapAggregation],
        }
    }
}

/// What a worker is asked to run: one stage or one macro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Single(Stage),
    Macro(MacroStage),
}

impl Step {
    /// Stage names first, then macro names
    pub fn from_name(name: &str) -> Option<Step> {
        Stage::from_name(name)
            .map(Step::Single)
            .or_else(|| MacroStage::from_name(name).map(Step::Macro))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::Single(stage) => stage.name(),
            Step::Macro(m) => m.name(),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        match self {
            Step::Single(stage) => std::slice::from_ref(stage),
            Step::Macro(m) => m.stages(),
        }
    }

    /// Whether workers of this step contribute to the shared heatmap
    pub fn aggregates(&self) -> bool {
        self.stages().contains(&Stage::HeatmapAggregation)
    }

    /// Every accepted step name, stages first
    pub fn names() -> Vec<&'static str> {
        Stage::ALL
            .iter()
            .map(Stage::name)
            .chain(MacroStage::ALL.iter().map(MacroStage::name))
            .collect()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Shared stage helpers
// ============================================================================

/// Register `moving` onto `target`, writing
/// `{subject}_{moving_label}_to_{target_label}_*` into `output_dir`
pub(crate) async fn register(
    pipeline: &Pipeline,
    subject: &str,
    output_dir: &Path,
    target: &Path,
    moving: &Path,
    moving_label: &str,
    target_label: &str,
) -> Result<ToolOutput, StageError> {
    info!(moving = moving_label, target = target_label, "Registering");
    let prefix = output_dir.join(naming::registration_prefix(subject, moving_label, target_label));
    pipeline
        .runner()
        .run_checked(&pipeline.toolkit().register(&prefix, target, moving))
        .await
}
