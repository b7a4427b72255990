//! TF-IDF cosine similarity over child chunks.
//!
//! A local stand-in for an embedding search service. [`ChunkVectors`] is
//! shared with the parent-document strategy, which matches the same chunks
//! but returns their enclosing document.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use oncall_shared::Result;

use crate::kb::{KnowledgeBase, TermIndex, tokenize};
use crate::types::{RetrievalQuery, RetrievalStrategy, RetrievedDocument};

/// L2-normalized TF-IDF vectors for every chunk of a knowledge base.
/// Term-ordered maps keep floating-point sums identical between runs.
pub(crate) struct ChunkVectors {
    index: TermIndex,
    vectors: Vec<BTreeMap<String, f64>>,
}

impl ChunkVectors {
    pub fn build(kb: &KnowledgeBase) -> Self {
        let index = TermIndex::build(kb.chunks().iter().map(|c| c.text.as_str()));
        let vectors = (0..index.len())
            .map(|i| {
                let len = index.lengths[i].max(1) as f64;
                let raw = index.term_counts[i]
                    .iter()
                    .map(|(t, &tf)| (t.clone(), tf as f64 / len * idf(&index, t)));
                l2_normalize(raw.collect())
            })
            .collect();
        Self { index, vectors }
    }

    /// `(chunk index, cosine)` for chunks with positive similarity, best first.
    pub fn search(&self, text: &str, admit: impl Fn(usize) -> bool) -> Vec<(usize, f64)> {
        let tokens = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let len = tokens.len() as f64;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for t in tokens {
            *counts.entry(t).or_default() += 1;
        }
        let query = l2_normalize(
            counts
                .into_iter()
                .map(|(t, tf)| {
                    let w = tf as f64 / len * idf(&self.index, &t);
                    (t, w)
                })
                .collect(),
        );

        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| admit(*i))
            .map(|(i, v)| (i, dot(&query, v)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored
    }
}

fn idf(index: &TermIndex, term: &str) -> f64 {
    let n = index.len() as f64;
    ((n + 1.0) / (index.df(term) as f64 + 1.0)).ln() + 1.0
}

fn l2_normalize(mut v: BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let norm = v.values().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.values_mut() {
            *x /= norm;
        }
    }
    v
}

fn dot(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(t, x)| large.get(t).map(|y| x * y))
        .sum()
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

pub struct SemanticStrategy {
    kb: Arc<KnowledgeBase>,
    vectors: ChunkVectors,
}

impl SemanticStrategy {
    pub const NAME: &'static str = "semantic";

    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        let vectors = ChunkVectors::build(&kb);
        Self { kb, vectors }
    }
}

#[async_trait]
impl RetrievalStrategy for SemanticStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
        let chunks = self.kb.chunks();
        let admit = |i: usize| {
            self.kb
                .document(&chunks[i].parent_id)
                .is_some_and(|d| query.matches(&d.metadata))
        };

        Ok(self
            .vectors
            .search(&query.text, admit)
            .into_iter()
            .take(query.top_k)
            .map(|(i, score)| {
                let chunk = &chunks[i];
                let metadata = self
                    .kb
                    .document(&chunk.parent_id)
                    .map(|d| d.metadata.clone())
                    .unwrap_or_default();
                RetrievedDocument::new(&chunk.id, &chunk.text, score, Self::NAME)
                    .with_parent(&chunk.parent_id)
                    .with_metadata(metadata)
            })
            .collect())
    }
}
