//! Error-like lines worth carrying into triage and search queries.

use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on signals kept per artifact.
pub const MAX_SIGNALS: usize = 20;

const MAX_SIGNAL_CHARS: usize = 200;

static SIGNAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|exception|failed|failure|timeout|timed out|panic(ked)?|refused|fatal|oom)\b")
        .expect("valid regex")
});

/// Distinct error-like lines, in order of first appearance.
pub fn extract_signals(text: &str) -> Vec<String> {
    let mut signals: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || !SIGNAL_RE.is_match(line) {
            continue;
        }
        let line: String = line.chars().take(MAX_SIGNAL_CHARS).collect();
        if !signals.contains(&line) {
            signals.push(line);
        }
        if signals.len() == MAX_SIGNALS {
            break;
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_error_like_lines_once() {
        let text = "ok\nERROR db: connection refused\nERROR db: connection refused\nthread 'main' panicked at src/main.rs\nerrors_total=0";
        let signals = extract_signals(text);
        assert_eq!(
            signals,
            vec![
                "ERROR db: connection refused".to_string(),
                "thread 'main' panicked at src/main.rs".to_string(),
            ]
        );
    }

    #[test]
    fn caps_signal_count_and_length() {
        let text: String = (0..50).map(|i| format!("error {i} {}\n", "x".repeat(300))).collect();
        let signals = extract_signals(&text);
        assert_eq!(signals.len(), MAX_SIGNALS);
        assert!(signals.iter().all(|s| s.chars().count() == MAX_SIGNAL_CHARS));
    }
}
