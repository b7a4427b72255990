//! Artifact extraction for Oncall Lens.
//!
//! Turns uploaded incident files (logs, stack traces, diffs, configs,
//! status pages, screenshots) into annotated text plus a list of
//! error-like "signals" used by triage.

mod classify;
mod html;
mod process;
pub mod signals;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument};

use oncall_shared::{Artifact, OncallError, Result, UploadConfig};

pub use classify::{ArtifactKind, classify, extension};
pub use signals::extract_signals;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Text extracted from one artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedArtifact {
    pub name: String,
    pub kind: ArtifactKind,
    /// Processed, prompt-ready text.
    pub text: String,
    pub size_bytes: usize,
    /// Error-like lines from the raw content.
    pub signals: Vec<String>,
    /// Non-fatal notes (lossy decoding, invalid JSON, ...).
    pub notes: Vec<String>,
}

/// The artifact extraction collaborator: bytes in, structured text out.
///
/// A failure concerns only the artifact it was called with.
#[async_trait]
pub trait ArtifactExtractor: Send + Sync {
    async fn extract(&self, artifact: &Artifact) -> Result<ExtractedArtifact>;
}

// ---------------------------------------------------------------------------
// Default extractor
// ---------------------------------------------------------------------------

/// Classifies by file name and applies per-kind processing.
#[derive(Debug, Clone)]
pub struct FileTypeExtractor {
    max_file_size: usize,
    allowed_extensions: Vec<String>,
}

impl Default for FileTypeExtractor {
    fn default() -> Self {
        Self::new(&UploadConfig::default())
    }
}

impl FileTypeExtractor {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
        }
    }

    /// Reject empty, oversized, or disallowed artifacts.
    pub fn validate(&self, artifact: &Artifact) -> Result<()> {
        if artifact.name.trim().is_empty() {
            return Err(OncallError::extraction("<unnamed>", "file name is required"));
        }
        let ext = extension(&artifact.name);
        if !self.allowed_extensions.iter().any(|a| *a == ext) {
            return Err(OncallError::extraction(
                &artifact.name,
                format!(
                    "unsupported file type '{ext}' (allowed: {})",
                    self.allowed_extensions.join(", ")
                ),
            ));
        }
        if artifact.bytes.is_empty() {
            return Err(OncallError::extraction(&artifact.name, "file is empty"));
        }
        if artifact.bytes.len() > self.max_file_size {
            return Err(OncallError::extraction(
                &artifact.name,
                format!(
                    "file too large: {} bytes (maximum {})",
                    artifact.bytes.len(),
                    self.max_file_size
                ),
            ));
        }
        Ok(())
    }

    /// Synchronous core of [`ArtifactExtractor::extract`].
    #[instrument(skip_all, fields(artifact = %artifact.name, size = artifact.bytes.len()))]
    pub fn process(&self, artifact: &Artifact) -> Result<ExtractedArtifact> {
        self.validate(artifact)?;

        let name = artifact.name.as_str();
        let kind = classify(name, &artifact.bytes);
        let mut notes = Vec::new();

        if kind == ArtifactKind::Screenshot || classify::is_image(name) {
            return Ok(ExtractedArtifact {
                name: name.to_string(),
                kind,
                text: process::describe_image(name, &artifact.bytes),
                size_bytes: artifact.bytes.len(),
                signals: Vec::new(),
                notes,
            });
        }

        let raw = match std::str::from_utf8(&artifact.bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                notes.push("content is not valid UTF-8; decoded lossily".to_string());
                String::from_utf8_lossy(&artifact.bytes).into_owned()
            }
        };
        if raw.trim().is_empty() {
            return Err(OncallError::extraction(name, "no text content"));
        }

        let text = match kind {
            ArtifactKind::Log => process::tag_log(&raw),
            ArtifactKind::StackTrace => process::tag_stack_trace(&raw),
            ArtifactKind::CodeDiff => process::tag_diff(&raw),
            ArtifactKind::Configuration => {
                let (text, note) = process::format_json(&raw);
                notes.extend(note);
                text
            }
            ArtifactKind::WebPage => html::to_markdown(name, &raw)?,
            ArtifactKind::Postmortem
            | ArtifactKind::Metrics
            | ArtifactKind::Documentation
            | ArtifactKind::MetricsData
            | ArtifactKind::PlainText
            | ArtifactKind::Screenshot => raw.clone(),
        };

        let signals = extract_signals(&raw);
        debug!(%kind, signals = signals.len(), "artifact extracted");

        Ok(ExtractedArtifact {
            name: name.to_string(),
            kind,
            text,
            size_bytes: artifact.bytes.len(),
            signals,
            notes,
        })
    }
}

#[async_trait]
impl ArtifactExtractor for FileTypeExtractor {
    async fn extract(&self, artifact: &Artifact) -> Result<ExtractedArtifact> {
        self.process(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FileTypeExtractor {
        FileTypeExtractor::default()
    }

    #[test]
    fn log_artifact_is_tagged_with_signals() {
        let artifact = Artifact::new(
            "api.log",
            "12:00 INFO boot\n12:01 ERROR upstream timed out\n12:02 WARN retrying",
        );
        let out = extractor().process(&artifact).unwrap();
        assert_eq!(out.kind, ArtifactKind::Log);
        assert!(out.text.contains("[ERROR] 12:01 ERROR upstream timed out"));
        assert_eq!(out.signals, vec!["12:01 ERROR upstream timed out".to_string()]);
        assert!(out.notes.is_empty());
    }

    #[test]
    fn disallowed_extension_is_extraction_error() {
        let err = extractor()
            .process(&Artifact::new("payload.exe", "MZ"))
            .unwrap_err();
        assert!(matches!(err, OncallError::ArtifactExtraction { .. }));
        assert!(err.to_string().contains("unsupported file type '.exe'"));
    }

    #[test]
    fn empty_and_oversized_rejected() {
        let ex = FileTypeExtractor::new(&UploadConfig {
            max_file_size: 4,
            ..UploadConfig::default()
        });
        assert!(ex.process(&Artifact::new("a.txt", "")).is_err());
        let err = ex.process(&Artifact::new("a.txt", "too long")).unwrap_err();
        assert!(err.to_string().contains("file too large"));
    }

    #[test]
    fn whitespace_only_text_rejected() {
        let err = extractor().process(&Artifact::new("a.txt", "  \n\t")).unwrap_err();
        assert!(err.to_string().contains("no text content"));
    }

    #[test]
    fn invalid_utf8_decodes_lossily() {
        let artifact = Artifact::new("dump.txt", vec![b'o', b'k', 0xff, b'!']);
        let out = extractor().process(&artifact).unwrap();
        assert_eq!(out.text, "ok\u{fffd}!");
        assert_eq!(out.notes.len(), 1);
    }

    #[test]
    fn screenshot_becomes_placeholder() {
        let artifact = Artifact::new("grafana.png", vec![0x89, b'P', b'N', b'G']);
        let out = extractor().process(&artifact).unwrap();
        assert_eq!(out.kind, ArtifactKind::Screenshot);
        assert!(out.text.starts_with("[IMAGE] grafana.png"));
        assert!(out.signals.is_empty());
    }

    #[test]
    fn image_named_like_metrics_keeps_kind_but_is_not_decoded() {
        let artifact = Artifact::new("cpu_usage.png", vec![0x89, b'P', b'N', b'G']);
        let out = extractor().process(&artifact).unwrap();
        assert_eq!(out.kind, ArtifactKind::Metrics);
        assert!(out.text.starts_with("[IMAGE] cpu_usage.png"));
    }

    #[test]
    fn invalid_json_is_kept_with_note() {
        let out = extractor()
            .process(&Artifact::new("settings.json", "{\"pool\": "))
            .unwrap();
        assert_eq!(out.kind, ArtifactKind::Configuration);
        assert_eq!(out.text, "{\"pool\": ");
        assert!(out.notes[0].starts_with("invalid JSON"));
    }

    #[tokio::test]
    async fn trait_object_dispatch() {
        let ex: Box<dyn ArtifactExtractor> = Box::new(extractor());
        let out = ex
            .extract(&Artifact::new("fix.diff", "@@ -1 +1 @@\n-a\n+b"))
            .await
            .unwrap();
        assert_eq!(out.kind, ArtifactKind::CodeDiff);
        assert!(out.text.contains("[ADDED] +b"));
    }
}
