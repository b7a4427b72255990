//! Incident-analysis pipeline for Oncall Lens.
//!
//! Ties artifact extraction, historical retrieval and the LLM together into
//! a staged analysis whose progress is published on the task registry.

pub mod context;
pub mod llm;
pub mod pipeline;
pub mod service;
mod stages;

pub use context::{IncidentContext, Synthesis};
pub use llm::{LlmProvider, LlmQueryExpander, OpenRouterClient, parse_json};
pub use pipeline::{Orchestrator, next_stage};
pub use service::{AnalysisService, build_engine};
pub use stages::{HISTORICAL_WEIGHT, ROOT_CAUSE_WEIGHT, aggregate_confidence};
