//! Per-task working state threaded through the pipeline stages.

use std::time::Instant;

use chrono::Utc;

use oncall_extract::ExtractedArtifact;
use oncall_retrieval::RetrievedDocument;
use oncall_shared::{AnalysisReport, Recommendation, RootCause, SourceRef, TaskId};

/// Output of the synthesis stage.
#[derive(Debug, Clone, Default)]
pub struct Synthesis {
    pub report: String,
    pub confidence: f64,
    pub recommendations: Vec<Recommendation>,
}

/// Everything one pipeline run knows about its incident.
///
/// Owned by a single run; each stage takes it by value and hands back the
/// updated context.
#[derive(Debug)]
pub struct IncidentContext {
    pub task_id: TaskId,
    pub started: Instant,
    pub files_total: usize,
    /// Artifacts that extracted successfully, in upload order.
    pub artifacts: Vec<ExtractedArtifact>,
    /// Non-fatal problems, shown to the reader of the report.
    pub annotations: Vec<String>,
    pub triage_summary: String,
    pub historical: Vec<RetrievedDocument>,
    /// Top fused retrieval score scaled into `[0, 1]`.
    pub historical_confidence: f64,
    /// Ranked best first, confidences clamped to `[0, 1]`.
    pub hypotheses: Vec<RootCause>,
    pub synthesis: Option<Synthesis>,
}

impl IncidentContext {
    pub fn new(task_id: TaskId, files_total: usize) -> Self {
        Self {
            task_id,
            started: Instant::now(),
            files_total,
            artifacts: Vec::new(),
            annotations: Vec::new(),
            triage_summary: String::new(),
            historical: Vec::new(),
            historical_confidence: 0.0,
            hypotheses: Vec::new(),
            synthesis: None,
        }
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.annotations.contains(&note) {
            self.annotations.push(note);
        }
    }

    /// Confidence of the best root-cause hypothesis, or 0.
    pub fn root_cause_confidence(&self) -> f64 {
        self.hypotheses.first().map_or(0.0, |h| h.confidence)
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        self.historical
            .iter()
            .map(|doc| SourceRef {
                id: doc.id.clone(),
                title: doc.title().to_string(),
                source: doc.source().to_string(),
                score: doc.fused_score,
            })
            .collect()
    }

    /// Final report; a context that never reached synthesis yields an
    /// empty report body.
    pub fn into_report(self) -> AnalysisReport {
        let sources = self.sources();
        let synthesis = self.synthesis.unwrap_or_default();
        AnalysisReport {
            report: synthesis.report,
            confidence: synthesis.confidence,
            sources,
            root_causes: self.hypotheses,
            recommendations: synthesis.recommendations,
            annotations: self.annotations,
            files_processed: self.artifacts.len(),
            files_total: self.files_total,
            processing_time_ms: self.started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        }
    }
}
