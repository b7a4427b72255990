//! Shared types, error model, and configuration for Oncall Lens.
//!
//! This crate is the foundation depended on by all other Oncall Lens crates.
//! It provides:
//! - [`OncallError`]: the unified error type and its [`ErrorKind`] classification
//! - Domain types ([`TaskId`], [`Stage`], [`ProgressEvent`], [`AnalysisReport`])
//! - Configuration ([`AppConfig`], config loading and validation)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, Band, LlmConfig, PipelineConfig, RegistryConfig, RerankerConfig,
    RetrievalConfig, StageBands, UploadConfig, config_dir, config_file_path, init_config,
    init_config_at, load_config, load_config_from, load_config_or_default, resolve_api_key,
    validate_api_key,
};
pub use error::{ErrorKind, OncallError, Result};
pub use types::{
    AnalysisReport, Artifact, ProgressEvent, Recommendation, RootCause, SourceRef, Stage,
    TaskFailure, TaskId, TaskOutcome, TaskResult,
};
