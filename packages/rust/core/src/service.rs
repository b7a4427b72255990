//! The boundary the analysis core presents upward: create a task, follow it,
//! fetch its result.

use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use tokio::task::JoinHandle;
use tracing::{error, info};

use oncall_extract::{ArtifactExtractor, FileTypeExtractor};
use oncall_progress::{Subscription, TaskRegistry, sse};
use oncall_retrieval::{
    ChunkingOptions, CohereReranker, EngineOptions, KnowledgeBase, QueryExpander,
    RetrievalEngine,
};
use oncall_shared::{
    AppConfig, Artifact, ErrorKind, OncallError, Result, Stage, TaskFailure, TaskId, TaskResult,
};

use crate::llm::{LlmProvider, LlmQueryExpander};
use crate::pipeline::Orchestrator;

/// Load the knowledge base and register the built-in strategies.
///
/// `multi_query` is only available when an LLM is supplied to expand
/// queries; the reranker is added when enabled in config.
pub fn build_engine(
    config: &AppConfig,
    llm: Option<Arc<dyn LlmProvider>>,
) -> Result<RetrievalEngine> {
    let chunking = ChunkingOptions {
        size: config.retrieval.chunk_size,
        overlap: config.retrieval.chunk_overlap,
    };
    let kb = KnowledgeBase::load(Path::new(&config.retrieval.knowledge_base_path), chunking)?;
    info!(
        documents = kb.documents().len(),
        chunks = kb.chunks().len(),
        "knowledge base loaded"
    );

    let options = EngineOptions::from_config(&config.retrieval, &config.reranker);
    let expander = llm.map(|llm| {
        let expander: Arc<dyn QueryExpander> = Arc::new(LlmQueryExpander::new(llm));
        (expander, config.retrieval.multi_query_variants)
    });

    let mut engine = RetrievalEngine::builtin(Arc::new(kb), options, expander);
    if config.reranker.enabled {
        engine = engine.with_reranker(Arc::new(CohereReranker::from_config(&config.reranker)?));
    }
    Ok(engine)
}

/// Creates analysis tasks and exposes their progress and results.
pub struct AnalysisService {
    orchestrator: Arc<Orchestrator>,
}

impl AnalysisService {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Wire every collaborator from configuration.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmProvider>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(TaskRegistry::new(config.registry.clone()));
        let extractor: Arc<dyn ArtifactExtractor> = Arc::new(FileTypeExtractor::new(&config.upload));
        let engine = build_engine(config, Some(Arc::clone(&llm)))?;
        let weights = engine.weights_from_config(&config.retrieval)?;

        Ok(Self::new(Orchestrator::new(
            registry,
            extractor,
            Arc::new(engine),
            weights,
            llm,
            config.pipeline.clone(),
            config.retrieval.top_k,
        )))
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        self.orchestrator.registry()
    }

    /// Start an analysis in the background and return its id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(&self, artifacts: Vec<Artifact>) -> Result<TaskId> {
        if artifacts.is_empty() {
            return Err(OncallError::validation("at least one artifact is required"));
        }

        let registry = Arc::clone(self.registry());
        let task_id = registry.create_task();
        info!(%task_id, files = artifacts.len(), "analysis task created");

        let orchestrator = Arc::clone(&self.orchestrator);
        let run = tokio::spawn(async move { orchestrator.run(task_id, artifacts).await });

        // A panicking run must still leave the task terminal.
        tokio::spawn(async move {
            if let Err(join_err) = run.await {
                let stage = registry
                    .snapshot(task_id)
                    .map(|event| event.stage)
                    .unwrap_or(Stage::Created);
                error!(%task_id, error = %join_err, "analysis run aborted");
                let failure = TaskFailure {
                    kind: ErrorKind::Internal,
                    stage,
                    message: format!("analysis run aborted: {join_err}"),
                };
                let _ = registry.complete(task_id, Err(failure));
            }
        });

        Ok(task_id)
    }

    pub fn subscribe(&self, task_id: TaskId) -> Result<Subscription> {
        self.registry().subscribe(task_id)
    }

    /// Progress as text/event-stream frames. Dropping the stream does not
    /// affect the running task.
    pub fn event_stream(&self, task_id: TaskId) -> Result<impl Stream<Item = String> + Send> {
        Ok(sse::event_stream(self.subscribe(task_id)?))
    }

    pub fn get_result(&self, task_id: TaskId) -> Result<TaskResult> {
        self.registry().get_result(task_id)
    }

    pub fn evict(&self, task_id: TaskId) -> Result<()> {
        self.registry().evict(task_id)
    }

    /// Periodically drop completed tasks older than the configured TTL.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.registry().spawn_sweeper()
    }
}
