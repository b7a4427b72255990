//! The four working stages of an analysis.
//!
//! Each stage takes the context by value and returns it updated; any
//! concurrent sub-calls are joined before the stage returns.

use std::fmt::Write as _;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use oncall_extract::ExtractedArtifact;
use oncall_retrieval::{RetrievalQuery, RetrievedDocument};
use oncall_shared::{Artifact, OncallError, Recommendation, Result, RootCause};

use crate::context::{IncidentContext, Synthesis};
use crate::llm::parse_json;
use crate::pipeline::{Orchestrator, StageProgress};

/// Weight of the historical match in the aggregate confidence.
pub const HISTORICAL_WEIGHT: f64 = 0.4;
/// Weight of the best root-cause hypothesis in the aggregate confidence.
pub const ROOT_CAUSE_WEIGHT: f64 = 0.6;

const SUMMARY_SIGNALS_PER_ARTIFACT: usize = 5;
const MAX_QUERY_CHARS: usize = 512;
const DOC_SNIPPET_CHARS: usize = 600;
const ARTIFACT_EXCERPT_CHARS: usize = 1500;

/// One LLM completion under the stage deadline. A provider that never
/// answers fails the call as an LLM error.
async fn ask_llm(orch: &Orchestrator, system: &str, prompt: &str) -> Result<String> {
    let timeout = orch.config.llm_timeout();
    match tokio::time::timeout(timeout, orch.llm.complete(system, prompt)).await {
        Ok(reply) => reply,
        Err(_) => Err(OncallError::LlmProvider(format!(
            "no response within {}s",
            timeout.as_secs()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Triage
// ---------------------------------------------------------------------------

/// Extract every artifact concurrently. Individual failures are annotated;
/// the stage fails only when nothing could be extracted.
#[instrument(skip_all, fields(task_id = %ctx.task_id, files = artifacts.len()))]
pub(crate) async fn triage(
    orch: &Orchestrator,
    mut ctx: IncidentContext,
    artifacts: &[Artifact],
    progress: &StageProgress<'_>,
) -> Result<IncidentContext> {
    let total = artifacts.len();
    let timeout = orch.config.extraction_timeout();
    progress.report(0.0, format!("Triaging {total} file(s)"));

    let extractor = &orch.extractor;
    let mut pending: FuturesUnordered<_> = artifacts
        .iter()
        .enumerate()
        .map(|(index, artifact)| async move {
            let result = match tokio::time::timeout(timeout, extractor.extract(artifact)).await {
                Ok(result) => result,
                Err(_) => Err(OncallError::extraction(
                    &artifact.name,
                    format!("timed out after {}s", timeout.as_secs()),
                )),
            };
            (index, result)
        })
        .collect();

    let mut results = Vec::with_capacity(total);
    while let Some(done) = pending.next().await {
        results.push(done);
        progress.report(
            results.len() as f64 / total.max(1) as f64,
            format!("Processed {}/{total} file(s)", results.len()),
        );
    }
    results.sort_by_key(|(index, _)| *index);

    for (_, result) in results {
        match result {
            Ok(extracted) => {
                for note in &extracted.notes {
                    ctx.annotate(format!("{}: {note}", extracted.name));
                }
                ctx.artifacts.push(extracted);
            }
            Err(e) => {
                warn!(error = %e, "artifact skipped");
                ctx.annotate(e.to_string());
            }
        }
    }

    if ctx.artifacts.is_empty() {
        return Err(OncallError::extraction(
            "all artifacts",
            format!("none of the {total} file(s) could be processed"),
        ));
    }

    ctx.annotations
        .insert(0, format!("{} of {total} files processed", ctx.artifacts.len()));
    ctx.triage_summary = summarize(&ctx.artifacts);

    info!(processed = ctx.artifacts.len(), total, "triage complete");
    Ok(ctx)
}

/// Per-artifact digest: its error signals, or its first lines when it has none.
pub(crate) fn summarize(artifacts: &[ExtractedArtifact]) -> String {
    let mut out = String::new();
    for artifact in artifacts {
        let _ = writeln!(out, "### {} ({})", artifact.name, artifact.kind);
        if artifact.signals.is_empty() {
            for line in artifact
                .text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(3)
            {
                let _ = writeln!(out, "{}", truncate_chars(line, 200));
            }
        } else {
            for signal in artifact.signals.iter().take(SUMMARY_SIGNALS_PER_ARTIFACT) {
                let _ = writeln!(out, "- {signal}");
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Historical search
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(task_id = %ctx.task_id))]
pub(crate) async fn historical_search(
    orch: &Orchestrator,
    mut ctx: IncidentContext,
    progress: &StageProgress<'_>,
) -> Result<IncidentContext> {
    let queries = build_queries(&ctx.artifacts, orch.config.max_queries, orch.top_k);
    progress.report(
        0.0,
        format!("Searching knowledge base with {} quer(ies)", queries.len()),
    );

    let outcome = orch.engine.retrieve_many(&queries, &orch.weights).await?;
    for note in &outcome.degraded {
        ctx.annotate(note.clone());
    }
    ctx.historical_confidence = outcome.top_confidence();
    ctx.historical = outcome.documents;

    progress.report(
        1.0,
        format!("Found {} similar incident(s)", ctx.historical.len()),
    );
    info!(
        documents = ctx.historical.len(),
        confidence = ctx.historical_confidence,
        "historical search complete"
    );
    Ok(ctx)
}

/// One combined query from each artifact's leading signal, then one query
/// per further distinct signal, up to `max_queries`.
pub(crate) fn build_queries(
    artifacts: &[ExtractedArtifact],
    max_queries: usize,
    top_k: usize,
) -> Vec<RetrievalQuery> {
    let leading: Vec<&str> = artifacts
        .iter()
        .filter_map(|a| a.signals.first().map(String::as_str))
        .collect();

    let primary = if leading.is_empty() {
        artifacts
            .first()
            .map(|a| a.text.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default()
    } else {
        leading.join(" ")
    };

    let mut texts = vec![truncate_chars(&primary, MAX_QUERY_CHARS)];
    for signal in artifacts.iter().flat_map(|a| a.signals.iter()) {
        if texts.len() >= max_queries.max(1) {
            break;
        }
        let text = truncate_chars(signal, MAX_QUERY_CHARS);
        if !texts.contains(&text) {
            texts.push(text);
        }
    }

    texts
        .into_iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| RetrievalQuery::new(t, top_k))
        .collect()
}

// ---------------------------------------------------------------------------
// Root cause
// ---------------------------------------------------------------------------

const ROOT_CAUSE_SYSTEM: &str = "You are a senior site reliability engineer performing \
root-cause analysis of a production incident. Reply with JSON only.";

#[derive(Deserialize)]
#[serde(untagged)]
enum HypothesesReply {
    Wrapped { root_causes: Vec<RawHypothesis> },
    Bare(Vec<RawHypothesis>),
}

#[derive(Deserialize)]
struct RawHypothesis {
    #[serde(default = "default_category")]
    category: String,
    description: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    evidence: Vec<String>,
}

fn default_category() -> String {
    "Unknown".into()
}

#[instrument(skip_all, fields(task_id = %ctx.task_id))]
pub(crate) async fn root_cause(
    orch: &Orchestrator,
    mut ctx: IncidentContext,
    progress: &StageProgress<'_>,
) -> Result<IncidentContext> {
    progress.report(0.0, "Generating root-cause hypotheses");

    let prompt = format!(
        "## Incident evidence\n{}\n\n## Similar past incidents\n{}\n\n\
         Identify the most likely root causes. Return\n\
         {{\"root_causes\": [{{\"category\": string, \"description\": string, \
         \"confidence\": number between 0 and 1, \"evidence\": [string]}}]}}\n\
         ranked most likely first.",
        evidence_section(&ctx),
        documents_section(&ctx.historical),
    );

    let reply = ask_llm(orch, ROOT_CAUSE_SYSTEM, &prompt).await?;
    ctx.hypotheses = parse_hypotheses(&reply)?;

    if ctx.hypotheses.is_empty() {
        ctx.annotate("No root-cause hypotheses were produced");
    }
    progress.report(
        1.0,
        format!("Ranked {} root-cause hypothesis(es)", ctx.hypotheses.len()),
    );
    Ok(ctx)
}

/// Parse, clamp and rank the hypotheses in an LLM reply.
pub(crate) fn parse_hypotheses(reply: &str) -> Result<Vec<RootCause>> {
    let raw = match parse_json::<HypothesesReply>(reply)? {
        HypothesesReply::Wrapped { root_causes } => root_causes,
        HypothesesReply::Bare(list) => list,
    };

    let mut hypotheses: Vec<RootCause> = raw
        .into_iter()
        .filter(|h| !h.description.trim().is_empty())
        .map(|h| RootCause {
            category: h.category,
            description: h.description,
            confidence: clamp_unit(h.confidence),
            evidence: h.evidence,
        })
        .collect();
    hypotheses.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    Ok(hypotheses)
}

/// Clamp into `[0, 1]`; non-finite values count as no confidence.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

const SYNTHESIS_SYSTEM: &str = "You are a senior site reliability engineer writing an \
incident analysis for the on-call team. Reply with JSON only.";

#[derive(Deserialize)]
struct SynthesisReply {
    summary: String,
    #[serde(default)]
    recommendations: Vec<RawRecommendation>,
}

#[derive(Deserialize)]
struct RawRecommendation {
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default = "default_recommendation_category")]
    category: String,
    action: String,
    #[serde(default)]
    rationale: String,
}

fn default_priority() -> String {
    "P2".into()
}
fn default_recommendation_category() -> String {
    "short-term".into()
}

#[instrument(skip_all, fields(task_id = %ctx.task_id))]
pub(crate) async fn synthesis(
    orch: &Orchestrator,
    mut ctx: IncidentContext,
    progress: &StageProgress<'_>,
) -> Result<IncidentContext> {
    progress.report(0.0, "Synthesizing report");

    let mut hypotheses = String::new();
    for (i, h) in ctx.hypotheses.iter().enumerate() {
        let _ = writeln!(
            hypotheses,
            "{}. [{}] {} (confidence {:.2}; evidence: {})",
            i + 1,
            h.category,
            h.description,
            h.confidence,
            h.evidence.join("; ")
        );
    }
    if hypotheses.is_empty() {
        hypotheses.push_str("None identified.\n");
    }

    let prompt = format!(
        "## Incident evidence\n{}\n\n## Similar past incidents\n{}\n\n\
         ## Root-cause hypotheses\n{hypotheses}\n\
         Write the incident analysis. Return\n\
         {{\"summary\": markdown string, \"recommendations\": [{{\"priority\": \"P0\"|\"P1\"|\"P2\", \
         \"category\": \"immediate\"|\"short-term\"|\"long-term\", \"action\": string, \
         \"rationale\": string}}]}}",
        ctx.triage_summary,
        documents_section(&ctx.historical),
    );

    let reply = ask_llm(orch, SYNTHESIS_SYSTEM, &prompt).await?;
    let parsed: SynthesisReply = parse_json(&reply)?;

    let confidence = aggregate_confidence(ctx.historical_confidence, ctx.root_cause_confidence());
    let report = compose_report(parsed.summary.trim(), &ctx.annotations);
    let recommendations = parsed
        .recommendations
        .into_iter()
        .filter(|r| !r.action.trim().is_empty())
        .map(|r| Recommendation {
            priority: r.priority,
            category: r.category,
            action: r.action,
            rationale: r.rationale,
        })
        .collect();

    ctx.synthesis = Some(Synthesis {
        report,
        confidence,
        recommendations,
    });
    progress.report(1.0, "Report ready");
    info!(confidence, "synthesis complete");
    Ok(ctx)
}

pub fn aggregate_confidence(historical_match: f64, root_cause: f64) -> f64 {
    clamp_unit(HISTORICAL_WEIGHT * clamp_unit(historical_match) + ROOT_CAUSE_WEIGHT * clamp_unit(root_cause))
}

fn compose_report(summary: &str, annotations: &[String]) -> String {
    let mut report = summary.to_string();
    if !annotations.is_empty() {
        report.push_str("\n\n## Processing notes\n");
        for note in annotations {
            let _ = writeln!(report, "- {note}");
        }
    }
    report.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Prompt helpers
// ---------------------------------------------------------------------------

fn evidence_section(ctx: &IncidentContext) -> String {
    let mut out = ctx.triage_summary.clone();
    for artifact in &ctx.artifacts {
        let _ = write!(
            out,
            "\n\n#### {} excerpt\n{}",
            artifact.name,
            truncate_chars(&artifact.text, ARTIFACT_EXCERPT_CHARS)
        );
    }
    out
}

fn documents_section(documents: &[RetrievedDocument]) -> String {
    if documents.is_empty() {
        return "No similar incidents found.".into();
    }
    let mut out = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let _ = writeln!(
            out,
            "[{}] {} ({}, score {:.2})\n{}\n",
            i + 1,
            doc.title(),
            doc.source(),
            doc.fused_score,
            truncate_chars(&doc.text, DOC_SNIPPET_CHARS)
        );
    }
    out.trim_end().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use oncall_extract::ArtifactKind;

    fn extracted(name: &str, signals: &[&str], text: &str) -> ExtractedArtifact {
        ExtractedArtifact {
            name: name.into(),
            kind: ArtifactKind::Log,
            text: text.into(),
            size_bytes: text.len(),
            signals: signals.iter().map(|s| s.to_string()).collect(),
            notes: Vec::new(),
        }
    }

    #[test]
    fn hypotheses_are_clamped_and_ranked() {
        let reply = r#"```json
{"root_causes": [
  {"category": "Config", "description": "pool too small", "confidence": 0.4},
  {"category": "Database", "description": "slow query", "confidence": 1.7, "evidence": ["p99"]},
  {"category": "Network", "description": "dns", "confidence": -0.2}
]}
```"#;
        let hypotheses = parse_hypotheses(reply).unwrap();
        let confidences: Vec<f64> = hypotheses.iter().map(|h| h.confidence).collect();
        assert_eq!(confidences, vec![1.0, 0.4, 0.0]);
        assert_eq!(hypotheses[0].evidence, vec!["p99"]);
    }

    #[test]
    fn bare_hypothesis_array_is_accepted() {
        let hypotheses =
            parse_hypotheses(r#"[{"description": "leak", "confidence": 0.5}]"#).unwrap();
        assert_eq!(hypotheses[0].category, "Unknown");
    }

    #[test]
    fn malformed_reply_is_llm_error() {
        let err = parse_hypotheses("I could not decide.").unwrap_err();
        assert!(matches!(err, OncallError::LlmProvider(_)));
    }

    #[test]
    fn aggregate_confidence_is_weighted_average() {
        assert!((aggregate_confidence(0.5, 1.0) - 0.8).abs() < 1e-12);
        assert!((aggregate_confidence(1.0, 0.0) - 0.4).abs() < 1e-12);
        assert_eq!(aggregate_confidence(f64::NAN, 2.0), 0.6);
    }

    #[test]
    fn queries_lead_with_combined_signals() {
        let artifacts = vec![
            extracted("api.log", &["ERROR pool exhausted", "ERROR timeout"], ""),
            extracted("worker.log", &["panic: nil map"], ""),
        ];
        let queries = build_queries(&artifacts, 3, 5);
        let texts: Vec<&str> = queries.iter().map(|q| q.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "ERROR pool exhausted panic: nil map",
                "ERROR pool exhausted",
                "ERROR timeout",
            ]
        );
        assert!(queries.iter().all(|q| q.top_k == 5));
    }

    #[test]
    fn queries_fall_back_to_text_without_signals() {
        let artifacts = vec![extracted("notes.txt", &[], "checkout   latency\nspiked")];
        let queries = build_queries(&artifacts, 3, 5);
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].text, "checkout latency spiked");
    }

    #[test]
    fn summary_lists_signals_per_artifact() {
        let summary = summarize(&[extracted("api.log", &["ERROR a"], "x")]);
        assert_eq!(summary, "### api.log (log)\n- ERROR a");
    }

    #[test]
    fn report_appends_processing_notes() {
        let report = compose_report("## Summary", &["2 of 3 files processed".to_string()]);
        assert!(report.ends_with("## Processing notes\n- 2 of 3 files processed"));
    }
}
