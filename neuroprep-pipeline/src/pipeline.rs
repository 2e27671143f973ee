//! Per-session orchestrator
//!
//! A [`Pipeline`] holds the collaborators every stage needs (configuration,
//! tool runner, predictor, run id) and drives one session through a
//! [`Step`]. A failing stage never stops the stages after it; its error is
//! logged and recorded in the [`StepReport`].

use crate::heatmap::lock::LockPolicy;
use crate::predict::{CommandPredictor, Predictor};
use crate::stages::{Stage, Step};
use crate::toolkit::Toolkit;
use crate::tools::{SystemToolRunner, ToolRunner};
use neuroprep_common::{PipelineConfig, SessionInfo};
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};

/// Stage collaborators shared by every session of a process
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn ToolRunner>,
    predictor: Arc<dyn Predictor>,
    toolkit: Toolkit,
    run_id: String,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        runner: Arc<dyn ToolRunner>,
        predictor: Arc<dyn Predictor>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            toolkit: Toolkit::new(config.clone()),
            config,
            runner,
            predictor,
            run_id: run_id.into(),
        }
    }

    /// Pipeline running real programs and the configured prediction command
    pub fn with_system_tools(config: Arc<PipelineConfig>, run_id: impl Into<String>) -> Self {
        let runner: Arc<dyn ToolRunner> = Arc::new(SystemToolRunner);
        let predictor = Arc::new(CommandPredictor::new(runner.clone(), config.models.clone()));
        Self::new(config, runner, predictor, run_id)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn runner(&self) -> &dyn ToolRunner {
        self.runner.as_ref()
    }

    /// Owned runner handle for spawned invocations
    pub fn shared_runner(&self) -> Arc<dyn ToolRunner> {
        self.runner.clone()
    }

    pub fn predictor(&self) -> &dyn Predictor {
        self.predictor.as_ref()
    }

    pub fn toolkit(&self) -> &Toolkit {
        &self.toolkit
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy::from(&self.config.heatmap)
    }

    /// Run every stage of `step` for one session
    ///
    /// After conversion, later stages read the converted images from the
    /// output folder.
    pub async fn run_step(&self, step: Step, session: SessionInfo) -> StepReport {
        let span = info_span!("session", subject = %session.subject, session = %session.session);

        async move {
            let mut session = session;
            let mut report = StepReport::default();

            for stage in step.stages() {
                let outcome = self.process(*stage, &session).await;
                report.outcomes.push(StageOutcome {
                    stage: *stage,
                    error: outcome.err(),
                });

                if *stage == Stage::Conversion {
                    session = session.advanced();
                }
            }

            info!(
                step = step.name(),
                failed = report.failures().count(),
                "Step finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    /// Run one stage, logging rather than propagating its failure
    pub async fn process(&self, stage: Stage, session: &SessionInfo) -> Result<(), String> {
        info!(stage = stage.name(), "Starting stage");

        match stage.run(self, session).await {
            Ok(()) => {
                info!(stage = stage.name(), "Stage complete");
                Ok(())
            }
            Err(e) => {
                error!(stage = stage.name(), kind = e.kind(), "Stage aborted: {}", e);
                Err(e.to_string())
            }
        }
    }
}

/// What happened to one stage of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub outcomes: Vec<StageOutcome>,
}

impl StepReport {
    pub fn failures(&self) -> impl Iterator<Item = &StageOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn succeeded(&self) -> bool {
        self.failures().next().is_none()
    }
}
