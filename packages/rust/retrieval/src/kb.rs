//! In-memory knowledge base of historical postmortems.
//!
//! Documents are Markdown files; each is split into overlapping child
//! chunks (`<doc>#<n>`) for chunk-level strategies.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use oncall_shared::{OncallError, Result};

use crate::types::Metadata;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A whole postmortem.
#[derive(Debug, Clone, PartialEq)]
pub struct KbDocument {
    /// File stem, e.g. `2023-04-db-failover`.
    pub id: String,
    pub text: String,
    /// Always has `source` and `title`, plus any header fields.
    pub metadata: Metadata,
}

impl KbDocument {
    /// Build a document, deriving `title` and header metadata from the text.
    pub fn new(id: impl Into<String>, source: impl Into<String>, text: impl Into<String>) -> Self {
        let id = id.into();
        let text = text.into();
        let mut metadata = parse_header_fields(&text);
        metadata.insert("source".into(), source.into());
        metadata.insert(
            "title".into(),
            extract_title(&text).unwrap_or_else(|| id.clone()),
        );
        Self { id, text, metadata }
    }
}

/// A child chunk of a [`KbDocument`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `<parent>#<n>`.
    pub id: String,
    pub parent_id: String,
    pub text: String,
}

/// Character-based chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingOptions {
    pub size: usize,
    pub overlap: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            size: 400,
            overlap: 50,
        }
    }
}

/// Summary counts for `kb stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KbStats {
    pub documents: usize,
    pub chunks: usize,
    pub total_bytes: usize,
    /// Header field → value → document count (e.g. `severity` → `SEV1` → 3).
    pub facets: BTreeMap<String, BTreeMap<String, usize>>,
}

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    documents: Vec<KbDocument>,
    chunks: Vec<Chunk>,
    by_id: HashMap<String, usize>,
}

impl KnowledgeBase {
    /// Load every `*.md` file in `dir` (sorted by file name).
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn load(dir: &Path, chunking: ChunkingOptions) -> Result<Self> {
        if !dir.is_dir() {
            return Err(OncallError::config(format!(
                "knowledge base directory not found: {}",
                dir.display()
            )));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| OncallError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in &paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "skipping non-UTF-8 file name");
                continue;
            };
            let text = std::fs::read_to_string(path).map_err(|e| OncallError::io(path, e))?;
            if text.trim().is_empty() {
                debug!(path = %path.display(), "skipping empty document");
                continue;
            }
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| stem.to_string());
            documents.push(KbDocument::new(stem, source, text));
        }

        let kb = Self::from_documents(documents, chunking);
        info!(
            documents = kb.documents.len(),
            chunks = kb.chunks.len(),
            "knowledge base loaded"
        );
        Ok(kb)
    }

    /// Build from already-loaded documents.
    pub fn from_documents(documents: Vec<KbDocument>, chunking: ChunkingOptions) -> Self {
        let mut chunks = Vec::new();
        let mut by_id = HashMap::new();
        for (i, doc) in documents.iter().enumerate() {
            by_id.insert(doc.id.clone(), i);
            for (n, text) in chunk_text(&doc.text, chunking).into_iter().enumerate() {
                chunks.push(Chunk {
                    id: format!("{}#{n}", doc.id),
                    parent_id: doc.id.clone(),
                    text,
                });
            }
        }
        Self {
            documents,
            chunks,
            by_id,
        }
    }

    pub fn documents(&self) -> &[KbDocument] {
        &self.documents
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn document(&self, id: &str) -> Option<&KbDocument> {
        self.by_id.get(id).map(|&i| &self.documents[i])
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn stats(&self) -> KbStats {
        let mut facets: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        for doc in &self.documents {
            for (key, value) in &doc.metadata {
                if key == "source" || key == "title" {
                    continue;
                }
                *facets
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default() += 1;
            }
        }
        KbStats {
            documents: self.documents.len(),
            chunks: self.chunks.len(),
            total_bytes: self.documents.iter().map(|d| d.text.len()).sum(),
            facets,
        }
    }
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// Split `text` into overlapping windows of at most `size` characters,
/// preferring to break on whitespace.
pub fn chunk_text(text: &str, opts: ChunkingOptions) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = opts.size.max(1);
    let overlap = opts.overlap.min(size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            // Back off to the last whitespace in the second half of the window.
            if let Some(ws) = (start + size / 2..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws;
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_]*").expect("valid regex"));

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "was", "were", "with",
];

/// Lowercased alphanumeric tokens without stopwords.
pub fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn extract_title(md: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));
    H1_RE.captures(md).map(|c| c[1].trim().to_string())
}

/// `Key: value` or `**Key:** value` lines near the top of a postmortem.
fn parse_header_fields(md: &str) -> Metadata {
    static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^[-*\s]*\**([A-Za-z][A-Za-z ]{1,30}?)\**\s*:\s*\**\s*(.+?)\s*$")
            .expect("valid regex")
    });

    md.lines()
        .take(20)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| FIELD_RE.captures(line))
        .map(|c| {
            (
                c[1].trim().to_lowercase().replace(' ', "_"),
                c[2].trim().to_string(),
            )
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Term index
// ---------------------------------------------------------------------------

/// Term statistics over a fixed list of text units (documents or chunks).
#[derive(Debug, Clone)]
pub(crate) struct TermIndex {
    pub term_counts: Vec<HashMap<String, usize>>,
    pub lengths: Vec<usize>,
    pub doc_freq: HashMap<String, usize>,
    pub avg_len: f64,
}

impl TermIndex {
    pub fn build<'a>(units: impl IntoIterator<Item = &'a str>) -> Self {
        let mut term_counts = Vec::new();
        let mut lengths = Vec::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for text in units {
            let tokens = tokenize(text);
            lengths.push(tokens.len());
            let mut counts: HashMap<String, usize> = HashMap::new();
            for t in tokens {
                *counts.entry(t).or_default() += 1;
            }
            for term in counts.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
            term_counts.push(counts);
        }

        let avg_len = if lengths.is_empty() {
            0.0
        } else {
            lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
        };

        Self {
            term_counts,
            lengths,
            doc_freq,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.term_counts.len()
    }

    pub fn df(&self, term: &str) -> usize {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }
}
