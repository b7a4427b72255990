//! Artifact classification by file name, then extension.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// What kind of incident artifact a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    StackTrace,
    Log,
    CodeDiff,
    Postmortem,
    Metrics,
    Documentation,
    Configuration,
    Screenshot,
    MetricsData,
    WebPage,
    PlainText,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StackTrace => "stack_trace",
            Self::Log => "log",
            Self::CodeDiff => "code_diff",
            Self::Postmortem => "postmortem",
            Self::Metrics => "metrics",
            Self::Documentation => "documentation",
            Self::Configuration => "configuration",
            Self::Screenshot => "screenshot",
            Self::MetricsData => "metrics_data",
            Self::WebPage => "web_page",
            Self::PlainText => "plain_text",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Documentation threshold for `.md` / `.txt` files.
const DOCUMENTATION_MIN_BYTES: usize = 1000;

/// Lowercase extension with leading dot, or empty.
pub fn extension(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// Binary image formats that are described rather than decoded.
pub(crate) fn is_image(name: &str) -> bool {
    matches!(extension(name).as_str(), ".png" | ".jpg" | ".jpeg")
}

/// Classify by name patterns first, then by extension.
pub fn classify(name: &str, bytes: &[u8]) -> ArtifactKind {
    let lower = name.to_lowercase();
    let has_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has_any(&["stack", "trace", "exception"]) {
        return ArtifactKind::StackTrace;
    }
    if has_any(&[".log", "error", "debug"]) {
        return ArtifactKind::Log;
    }
    if has_any(&[".diff", ".patch"]) {
        return ArtifactKind::CodeDiff;
    }
    if has_any(&["postmortem", "incident"]) {
        return ArtifactKind::Postmortem;
    }
    if has_any(&["cpu", "memory", "metrics", "dashboard"]) {
        return ArtifactKind::Metrics;
    }

    match extension(name).as_str() {
        ".log" => ArtifactKind::Log,
        ".diff" | ".patch" => ArtifactKind::CodeDiff,
        ".md" | ".txt" if bytes.len() > DOCUMENTATION_MIN_BYTES => ArtifactKind::Documentation,
        ".json" => ArtifactKind::Configuration,
        ".png" | ".jpg" | ".jpeg" => ArtifactKind::Screenshot,
        ".csv" => ArtifactKind::MetricsData,
        ".html" | ".htm" => ArtifactKind::WebPage,
        _ => ArtifactKind::PlainText,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_patterns_win_over_extension() {
        assert_eq!(classify("java_stacktrace.txt", b""), ArtifactKind::StackTrace);
        assert_eq!(classify("api-errors.json", b"{}"), ArtifactKind::Log);
        assert_eq!(classify("fix.patch", b""), ArtifactKind::CodeDiff);
        assert_eq!(classify("Incident-42.md", b""), ArtifactKind::Postmortem);
        assert_eq!(classify("cpu_usage.png", b""), ArtifactKind::Metrics);
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(classify("changes.diff", b""), ArtifactKind::CodeDiff);
        assert_eq!(classify("config.json", b"{}"), ArtifactKind::Configuration);
        assert_eq!(classify("screen.JPG", b""), ArtifactKind::Screenshot);
        assert_eq!(classify("latency.csv", b""), ArtifactKind::MetricsData);
        assert_eq!(classify("status.html", b""), ArtifactKind::WebPage);
        assert_eq!(classify("notes.txt", b"short"), ArtifactKind::PlainText);
        assert_eq!(
            classify("runbook.md", &[b'x'; 1001]),
            ArtifactKind::Documentation
        );
    }

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(extension("A.LOG"), ".log");
        assert_eq!(extension("no_ext"), "");
    }
}
