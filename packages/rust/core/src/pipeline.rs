//! The analysis state machine:
//! CREATED → TRIAGE → HISTORICAL_SEARCH → ROOT_CAUSE → SYNTHESIS → DONE,
//! with FAILED reachable from every working stage.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use oncall_extract::ArtifactExtractor;
use oncall_progress::TaskRegistry;
use oncall_retrieval::{FusionWeights, RetrievalEngine};
use oncall_shared::{
    Artifact, Band, OncallError, PipelineConfig, Result, Stage, TaskFailure, TaskId,
};

use crate::context::IncidentContext;
use crate::llm::LlmProvider;
use crate::stages;

/// The fixed transition table. `None` for terminal states.
pub fn next_stage(stage: Stage) -> Option<Stage> {
    match stage {
        Stage::Created => Some(Stage::Triage),
        Stage::Triage => Some(Stage::HistoricalSearch),
        Stage::HistoricalSearch => Some(Stage::RootCause),
        Stage::RootCause => Some(Stage::Synthesis),
        Stage::Synthesis => Some(Stage::Done),
        Stage::Done | Stage::Failed => None,
    }
}

/// Publishes stage-local progress mapped into the stage's band.
pub(crate) struct StageProgress<'a> {
    registry: &'a TaskRegistry,
    task_id: TaskId,
    stage: Stage,
    band: Band,
}

impl StageProgress<'_> {
    /// `fraction` is how far through its own work the stage is.
    pub(crate) fn report(&self, fraction: f64, message: impl Into<String>) {
        let percentage = self.band.at(fraction);
        if let Err(e) = self
            .registry
            .publish(self.task_id, self.stage, message, percentage)
        {
            warn!(task_id = %self.task_id, stage = %self.stage, error = %e, "progress not published");
        }
    }
}

/// Drives one task through every stage and records its outcome.
pub struct Orchestrator {
    pub(crate) extractor: Arc<dyn ArtifactExtractor>,
    pub(crate) engine: Arc<RetrievalEngine>,
    pub(crate) weights: FusionWeights,
    pub(crate) llm: Arc<dyn LlmProvider>,
    pub(crate) config: PipelineConfig,
    pub(crate) top_k: usize,
    registry: Arc<TaskRegistry>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        extractor: Arc<dyn ArtifactExtractor>,
        engine: Arc<RetrievalEngine>,
        weights: FusionWeights,
        llm: Arc<dyn LlmProvider>,
        config: PipelineConfig,
        top_k: usize,
    ) -> Self {
        Self {
            extractor,
            engine,
            weights,
            llm,
            config,
            top_k,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Run the pipeline to a terminal state. Never retries a stage; the
    /// outcome (report or classified failure) is always stored.
    #[instrument(skip_all, fields(%task_id, files = artifacts.len()))]
    pub async fn run(&self, task_id: TaskId, artifacts: Vec<Artifact>) {
        let mut ctx = IncidentContext::new(task_id, artifacts.len());
        let mut stage = Stage::Created;

        while let Some(next) = next_stage(stage) {
            if next == Stage::Done {
                break;
            }
            stage = next;

            let Some(band) = self.config.bands.band(stage) else {
                break;
            };
            let progress = StageProgress {
                registry: &self.registry,
                task_id,
                stage,
                band,
            };

            ctx = match self.run_stage(stage, ctx, &artifacts, &progress).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.fail(task_id, stage, &e);
                    return;
                }
            };
        }

        let report = ctx.into_report();
        info!(
            confidence = report.confidence,
            files_processed = report.files_processed,
            files_total = report.files_total,
            elapsed_ms = report.processing_time_ms,
            "analysis complete"
        );
        if let Err(e) = self.registry.complete(task_id, Ok(report)) {
            warn!(error = %e, "could not record task result");
        }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: IncidentContext,
        artifacts: &[Artifact],
        progress: &StageProgress<'_>,
    ) -> Result<IncidentContext> {
        match stage {
            Stage::Triage => stages::triage(self, ctx, artifacts, progress).await,
            Stage::HistoricalSearch => stages::historical_search(self, ctx, progress).await,
            Stage::RootCause => stages::root_cause(self, ctx, progress).await,
            Stage::Synthesis => stages::synthesis(self, ctx, progress).await,
            Stage::Created | Stage::Done | Stage::Failed => Err(OncallError::validation(
                format!("{stage} is not a working stage"),
            )),
        }
    }

    fn fail(&self, task_id: TaskId, stage: Stage, err: &OncallError) {
        let failure = TaskFailure {
            kind: err.kind(),
            stage,
            message: err.to_string(),
        };
        error!(%task_id, %stage, kind = %failure.kind, error = %err, "analysis failed");
        if let Err(e) = self.registry.complete(task_id, Err(failure)) {
            warn!(error = %e, "could not record task failure");
        }
    }
}
