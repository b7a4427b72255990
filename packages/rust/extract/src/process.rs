//! Per-kind text processing.
//!
//! Line-oriented kinds are tagged so the important lines stand out in
//! prompts; structured kinds are normalized.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub(crate) fn tag_log(text: &str) -> String {
    map_lines(text, |line| {
        let lower = line.to_lowercase();
        let has_any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has_any(&["error", "exception", "failed", "timeout", "panic", "fatal"]) {
            Some("ERROR")
        } else if has_any(&["warn"]) {
            Some("WARN")
        } else if has_any(&["info", "start", "stop", "success"]) {
            Some("INFO")
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Stack traces
// ---------------------------------------------------------------------------

static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Exception|Error|Traceback|thread '.*' panicked|[\w.$]+(Error|Exception)\b)")
        .expect("valid regex")
});

static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    // JVM `at pkg.Class.method(...)`, Python `File "x.py", line N`,
    // numbered native frames `12: crate::module::fn`.
    Regex::new(r#"^(at\s+[\w.$<>]+|File\s+".+",\s+line\s+\d+|\d+:\s+\S+::\S+)"#)
        .expect("valid regex")
});

pub(crate) fn tag_stack_trace(text: &str) -> String {
    map_lines(text, |line| {
        let trimmed = line.trim_start();
        if trimmed.starts_with("Caused by:") {
            Some("CAUSE")
        } else if EXCEPTION_RE.is_match(trimmed) {
            Some("EXCEPTION")
        } else if FRAME_RE.is_match(trimmed) {
            Some("FRAME")
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Diffs
// ---------------------------------------------------------------------------

pub(crate) fn tag_diff(text: &str) -> String {
    map_lines(text, |line| {
        if line.starts_with("@@") {
            Some("LOCATION")
        } else if line.starts_with('+') && !line.starts_with("+++") {
            Some("ADDED")
        } else if line.starts_with('-') && !line.starts_with("---") {
            Some("REMOVED")
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// JSON configuration
// ---------------------------------------------------------------------------

/// Pretty-printed JSON, or the raw text plus a note when it does not parse.
pub(crate) fn format_json(text: &str) -> (String, Option<String>) {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => (pretty, None),
            Err(e) => (text.to_string(), Some(format!("could not re-serialize JSON: {e}"))),
        },
        Err(e) => (text.to_string(), Some(format!("invalid JSON: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Screenshots
// ---------------------------------------------------------------------------

/// First 8 hex characters of the SHA-256 digest.
pub(crate) fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")[..8].to_string()
}

pub(crate) fn describe_image(name: &str, bytes: &[u8]) -> String {
    format!(
        "[IMAGE] {name}\nSize: {} bytes\nHash: {}\n\n\
         Screenshot or chart attached to the incident. Its pixels were not \
         analysed; refer to it by name when citing evidence.",
        bytes.len(),
        short_hash(bytes),
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn map_lines(text: &str, tag: impl Fn(&str) -> Option<&'static str>) -> String {
    text.lines()
        .map(|line| match tag(line) {
            Some(t) => format!("[{t}] {line}"),
            None => line.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
