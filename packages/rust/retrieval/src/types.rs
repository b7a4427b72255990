//! Query and result types plus the strategy contract.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use oncall_shared::Result;

/// Flat string metadata attached to documents (`source`, `title`, ...).
pub type Metadata = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A single retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    pub text: String,
    /// Every pair must equal the document's metadata for it to match.
    #[serde(default)]
    pub filters: Metadata,
    pub top_k: usize,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            filters: Metadata::new(),
            top_k,
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Same filters, different text or depth.
    pub fn derive(&self, text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            filters: self.filters.clone(),
            top_k,
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.filters
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// One ranked hit from a strategy, or one entry of a fused ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// Id of the matched unit (a whole document or a `<doc>#<n>` chunk).
    pub id: String,
    /// Enclosing document when the match was a chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Strategy-local score; not comparable across strategies.
    pub score: f64,
    /// Weighted, normalized score after fusion; 0 before.
    #[serde(default)]
    pub fused_score: f64,
    /// Name of the strategy that produced this hit.
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
}

impl RetrievedDocument {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        score: f64,
        strategy: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            text: text.into(),
            metadata: Metadata::new(),
            score,
            fused_score: 0.0,
            strategy: strategy.into(),
            rerank_score: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Deduplication key: the parent document for chunk hits, else the id.
    pub fn logical_id(&self) -> &str {
        self.parent_id.as_deref().unwrap_or(&self.id)
    }

    pub fn title(&self) -> &str {
        self.metadata
            .get("title")
            .map(String::as_str)
            .unwrap_or_else(|| self.logical_id())
    }

    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// The ordered output of one strategy for one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StrategyResults {
    pub strategy: String,
    pub documents: Vec<RetrievedDocument>,
}

impl StrategyResults {
    pub fn new(strategy: impl Into<String>, documents: Vec<RetrievedDocument>) -> Self {
        Self {
            strategy: strategy.into(),
            documents,
        }
    }

    pub fn empty(strategy: impl Into<String>) -> Self {
        Self::new(strategy, Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// A retrieval strategy: one ranked list per query, scores local to itself.
///
/// Built-in strategies run over the in-memory [`crate::KnowledgeBase`]; an
/// external lexical or embedding search service plugs in by implementing
/// this trait under the matching name.
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    /// Stable name used as the weight key (`lexical`, `semantic`, ...).
    fn name(&self) -> &str;

    /// Return at most `query.top_k` hits, best first.
    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>>;
}

/// Produces alternative phrasings of a query.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str, variants: usize) -> Result<Vec<String>>;
}
