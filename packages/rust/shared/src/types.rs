//! Core domain types shared across the analysis pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for analysis task identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Generate a new time-sortable task identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Pipeline state of a task.
///
/// The declaration order is the execution order; `Failed` is reachable from
/// every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Created,
    Triage,
    HistoricalSearch,
    RootCause,
    Synthesis,
    Done,
    Failed,
}

impl Stage {
    /// `Done` and `Failed` end a task.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Triage => "TRIAGE",
            Self::HistoricalSearch => "HISTORICAL_SEARCH",
            Self::RootCause => "ROOT_CAUSE",
            Self::Synthesis => "SYNTHESIS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// One observation of a task's progress, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
    /// Overall completion, 0..=100. Never decreases for a given task.
    pub percentage: u8,
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// An uploaded incident artifact (log, diff, stack trace, screenshot, ...).
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Original file name; drives classification.
    pub name: String,
    /// Raw content.
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A ranked root-cause hypothesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    /// e.g. "Database", "Configuration", "Code Bug".
    pub category: String,
    pub description: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// An actionable recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// P0, P1, P2.
    pub priority: String,
    /// immediate, short-term, long-term.
    pub category: String,
    pub action: String,
    #[serde(default)]
    pub rationale: String,
}

/// A historical document that backed the analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Logical document id.
    pub id: String,
    pub title: String,
    /// Source file or URI of the document.
    pub source: String,
    /// Fused retrieval score.
    pub score: f64,
}

/// The terminal, successful output of an analysis task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Markdown report text.
    pub report: String,
    /// Aggregate confidence in `[0, 1]`.
    pub confidence: f64,
    pub sources: Vec<SourceRef>,
    pub root_causes: Vec<RootCause>,
    pub recommendations: Vec<Recommendation>,
    /// Non-fatal degradations surfaced to the reader.
    #[serde(default)]
    pub annotations: Vec<String>,
    pub files_processed: usize,
    pub files_total: usize,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// The terminal error payload of a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    /// Stage that was running when the task failed.
    pub stage: Stage,
    /// Human-readable message.
    pub message: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.stage, self.kind, self.message)
    }
}

/// Outcome stored when a task completes.
pub type TaskOutcome = std::result::Result<AnalysisReport, TaskFailure>;

/// What `get_result` reports for a known task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    /// The task has not reached a terminal state yet.
    Pending,
    Completed { report: AnalysisReport },
    Failed { error: TaskFailure },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().expect("parse TaskId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn stage_order_matches_pipeline() {
        assert!(Stage::Created < Stage::Triage);
        assert!(Stage::Triage < Stage::HistoricalSearch);
        assert!(Stage::RootCause < Stage::Synthesis);
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Failed.is_terminal());
        assert!(!Stage::Synthesis.is_terminal());
    }

    #[test]
    fn progress_event_wire_format() {
        let event = ProgressEvent {
            stage: Stage::HistoricalSearch,
            message: "Searching postmortems".into(),
            percentage: 30,
            completed: false,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert_eq!(
            json,
            r#"{"stage":"HISTORICAL_SEARCH","message":"Searching postmortems","percentage":30,"completed":false}"#
        );
    }

    #[test]
    fn task_result_is_tagged() {
        let json = serde_json::to_string(&TaskResult::Pending).expect("serialize");
        assert_eq!(json, r#"{"status":"pending"}"#);

        let failed = TaskResult::Failed {
            error: TaskFailure {
                kind: ErrorKind::LlmProvider,
                stage: Stage::RootCause,
                message: "rate limited".into(),
            },
        };
        let json = serde_json::to_string(&failed).expect("serialize");
        assert!(json.contains(r#""status":"failed""#));
        assert!(json.contains(r#""kind":"llm_provider""#));
    }
}
