//! neuroprep pipeline library
//!
//! Stage pipeline engine for MRI preprocessing. Decides which files to feed
//! to which external imaging operation, in what order, and merges
//! per-subject lesion segmentations into one population heatmap under a
//! cross-process lock.
//!
//! # Architecture
//! - [`tools`]: external tool adapter (blocking and fan-out invocation)
//! - [`toolkit`]: command builders for the configured imaging toolkit
//! - [`predict`]: model-backed mask/segmentation collaborator
//! - [`state`]: typed view of a session folder (the filesystem is the state)
//! - [`selection`]: registration target and brain mask policy
//! - [`stages`]: stage registry, macro stages and stage bodies
//! - [`heatmap`]: lock, ledger, aggregation critical section, threshold
//! - [`pipeline`]: per-session orchestrator
//! - [`batch`]: one worker process per session

pub mod batch;
pub mod error;
pub mod heatmap;
pub mod logging;
pub mod pipeline;
pub mod predict;
pub mod selection;
pub mod stages;
pub mod state;
pub mod toolkit;
pub mod tools;

pub use crate::error::StageError;
pub use crate::pipeline::{Pipeline, StepReport};
pub use crate::stages::{MacroStage, Stage, Step};
pub use crate::tools::{ToolCommand, ToolOutput, ToolRunner};
