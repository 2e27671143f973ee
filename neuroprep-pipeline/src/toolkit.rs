//! Command builders for the configured imaging toolkit
//!
//! Turns configuration templates into concrete [`ToolCommand`]s. Nothing
//! here runs anything.

use crate::tools::ToolCommand;
use neuroprep_common::config::{PipelineConfig, ToolTemplate};
use std::path::Path;
use std::sync::Arc;

/// Resampling interpolation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    /// For label images (masks, segmentations)
    NearestNeighbour,
}

impl Interpolation {
    /// Name understood by the resampling tool
    pub fn conform_name(&self) -> &'static str {
        match self {
            Interpolation::Linear => "trilinear",
            Interpolation::NearestNeighbour => "nearestneighbour",
        }
    }

    /// Name understood by the transform application tool
    pub fn transform_name(&self) -> &'static str {
        match self {
            Interpolation::Linear => "Linear",
            Interpolation::NearestNeighbour => "NearestNeighbor",
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn render(template: &ToolTemplate, tokens: &[(&str, &str)]) -> ToolCommand {
    ToolCommand::new(template.program.clone()).args(template.render(tokens))
}

/// Builds tool invocations from [`PipelineConfig`]
#[derive(Debug, Clone)]
pub struct Toolkit {
    config: Arc<PipelineConfig>,
}

impl Toolkit {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    pub fn convert_dicom(&self, name: &str, output_dir: &Path, input_dir: &Path) -> ToolCommand {
        render(
            &self.config.tools.converter,
            &[
                ("name", name),
                ("output_dir", &path_str(output_dir)),
                ("input_dir", &path_str(input_dir)),
            ],
        )
    }

    pub fn probe_orientation(&self, dicom_file: &Path) -> ToolCommand {
        render(
            &self.config.tools.orientation_probe,
            &[("dicom_file", &path_str(dicom_file))],
        )
    }

    /// `None` when no reorientation tool is configured
    pub fn reorient(&self, input: &Path) -> Option<ToolCommand> {
        self.config
            .tools
            .reorient
            .as_ref()
            .map(|t| render(t, &[("input", &path_str(input))]))
    }

    pub fn conform(
        &self,
        input: &Path,
        reference: &Path,
        output: &Path,
        interpolation: Interpolation,
    ) -> ToolCommand {
        render(
            &self.config.tools.conform,
            &[
                ("input", &path_str(input)),
                ("reference", &path_str(reference)),
                ("output", &path_str(output)),
                ("interpolation", interpolation.conform_name()),
            ],
        )
    }

    pub fn volume_count(&self, input: &Path) -> ToolCommand {
        render(&self.config.tools.volume_count, &[("input", &path_str(input))])
    }

    pub fn first_volume(&self, input: &Path, output: &Path) -> ToolCommand {
        render(
            &self.config.tools.first_volume,
            &[("input", &path_str(input)), ("output", &path_str(output))],
        )
    }

    pub fn skull_strip(&self, input: &Path, output: &Path) -> ToolCommand {
        render(
            &self.config.tools.skull_strip,
            &[("input", &path_str(input)), ("output", &path_str(output))],
        )
    }

    /// `fslmaths {input} -mul {mask} {output}`
    pub fn apply_mask(&self, input: &Path, mask: &Path, output: &Path) -> ToolCommand {
        self.fslmaths(input, "-mul", &path_str(mask), output)
    }

    /// `fslmaths {a} -add {b} {output}`
    pub fn add(&self, a: &Path, b: &Path, output: &Path) -> ToolCommand {
        self.fslmaths(a, "-add", &path_str(b), output)
    }

    /// `fslmaths {input} -thr {threshold} {output}`: zero voxels below
    /// `threshold`
    pub fn threshold(&self, input: &Path, threshold: u64, output: &Path) -> ToolCommand {
        self.fslmaths(input, "-thr", &threshold.to_string(), output)
    }

    fn fslmaths(&self, input: &Path, op: &str, operand: &str, output: &Path) -> ToolCommand {
        ToolCommand::new(self.config.tools.fslmaths.clone())
            .path_arg(input)
            .arg(op)
            .arg(operand)
            .path_arg(output)
    }

    /// Rigid registration of `moving` onto `target`, writing
    /// `{prefix}Warped.nii.gz` and `{prefix}0GenericAffine.mat`
    pub fn register(&self, prefix: &Path, target: &Path, moving: &Path) -> ToolCommand {
        let registration = &self.config.registration;
        let args = registration.render(&[
            ("prefix", &path_str(prefix)),
            ("target_file", &path_str(target)),
            ("moving_file", &path_str(moving)),
        ]);
        ToolCommand::new(registration.program.clone()).args(args)
    }

    pub fn apply_transform(
        &self,
        input: &Path,
        reference: &Path,
        output: &Path,
        transform: &Path,
        interpolation: Interpolation,
    ) -> ToolCommand {
        render(
            &self.config.tools.apply_transforms,
            &[
                ("input", &path_str(input)),
                ("reference", &path_str(reference)),
                ("output", &path_str(output)),
                ("transform", &path_str(transform)),
                ("interpolation", interpolation.transform_name()),
            ],
        )
    }
}
