//! Model-backed prediction collaborator
//!
//! Brain masks and stroke segmentations come from trained models. The
//! pipeline only decides inputs and output locations; inference itself runs
//! in a configured external command.

use crate::tools::{ToolCommand, ToolError, ToolRunner};
use async_trait::async_trait;
use neuroprep_common::config::ModelsConfig;
use neuroprep_common::Sequence;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Prediction errors
#[derive(Debug, Error)]
pub enum PredictError {
    /// Model file does not exist
    #[error("Model not found: {0}")]
    ModelNotFound(PathBuf),

    /// Prediction command could not be run
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Prediction command exited non-zero
    #[error("Prediction command `{command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Command reported success but wrote nothing
    #[error("Prediction produced no output at {0}")]
    NoOutput(PathBuf),
}

/// What to predict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTask {
    /// Binary brain mask for one structural sequence
    BrainMask { sequence: Sequence },
    /// Stroke lesion segmentation from a diffusion image plus ADC
    StrokeSegmentation { on_dwi: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionRequest {
    pub task: ModelTask,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
}

impl PredictionRequest {
    pub fn brain_mask(sequence: Sequence, input: PathBuf, output: PathBuf) -> Self {
        Self {
            task: ModelTask::BrainMask { sequence },
            inputs: vec![input],
            output,
        }
    }

    /// `diffusion` is the b1000 image, or the DWI image when `on_dwi`
    pub fn stroke(on_dwi: bool, diffusion: PathBuf, adc: PathBuf, output: PathBuf) -> Self {
        Self {
            task: ModelTask::StrokeSegmentation { on_dwi },
            inputs: vec![diffusion, adc],
            output,
        }
    }
}

/// Produces a mask or segmentation volume at `request.output`
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, request: &PredictionRequest) -> Result<(), PredictError>;
}

/// Runs the configured prediction command through a [`ToolRunner`]
pub struct CommandPredictor {
    runner: Arc<dyn ToolRunner>,
    models: ModelsConfig,
}

impl CommandPredictor {
    pub fn new(runner: Arc<dyn ToolRunner>, models: ModelsConfig) -> Self {
        Self { runner, models }
    }

    fn model_path(&self, task: ModelTask) -> PathBuf {
        match task {
            ModelTask::BrainMask { sequence } => self.models.brain_mask_model_path(sequence.as_str()),
            ModelTask::StrokeSegmentation { on_dwi } => self.models.stroke_model_path(on_dwi),
        }
    }

    pub fn command(&self, request: &PredictionRequest) -> ToolCommand {
        let model = self.model_path(request.task).to_string_lossy().to_string();
        let output = request.output.to_string_lossy().to_string();
        let template = &self.models.command;

        ToolCommand::new(template.program.clone())
            .args(template.render(&[("model", &model), ("output", &output)]))
            .args(request.inputs.iter().map(|p| p.to_string_lossy().to_string()))
    }
}

#[async_trait]
impl Predictor for CommandPredictor {
    async fn predict(&self, request: &PredictionRequest) -> Result<(), PredictError> {
        let model = self.model_path(request.task);
        if !model.exists() {
            return Err(PredictError::ModelNotFound(model));
        }

        info!(model = %model.display(), output = %request.output.display(), "Running prediction");

        let output = self.runner.run(&self.command(request)).await?;
        if !output.success() {
            return Err(PredictError::Failed {
                command: output.command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        if !request.output.exists() {
            return Err(PredictError::NoOutput(request.output.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::SystemToolRunner;

    #[test]
    fn test_command_appends_inputs() {
        let predictor = CommandPredictor::new(Arc::new(SystemToolRunner), ModelsConfig::default());
        let request = PredictionRequest::stroke(
            false,
            PathBuf::from("/s/S01_AX_b1000.nii.gz"),
            PathBuf::from("/s/S01_AX_ADC.nii.gz"),
            PathBuf::from("/o/seg.nii.gz"),
        );
        let cmd = predictor.command(&request);
        assert_eq!(cmd.program, "neuroprep-predict");
        assert_eq!(
            cmd.args,
            [
                "--model",
                "models/2d/stroke_segmentation_b1000.keras",
                "--output",
                "/o/seg.nii.gz",
                "/s/S01_AX_b1000.nii.gz",
                "/s/S01_AX_ADC.nii.gz",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_model_is_reported() {
        let models = ModelsConfig {
            dir: PathBuf::from("/nonexistent/neuroprep/models"),
            ..ModelsConfig::default()
        };
        let predictor = CommandPredictor::new(Arc::new(SystemToolRunner), models);
        let request = PredictionRequest::brain_mask(
            Sequence::T1,
            PathBuf::from("in.nii.gz"),
            PathBuf::from("out.nii.gz"),
        );
        assert!(matches!(
            predictor.predict(&request).await,
            Err(PredictError::ModelNotFound(_))
        ));
    }
}
