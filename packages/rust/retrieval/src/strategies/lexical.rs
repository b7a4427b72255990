//! BM25 over whole documents.

use std::sync::Arc;

use async_trait::async_trait;

use oncall_shared::Result;

use crate::kb::{KnowledgeBase, TermIndex, tokenize};
use crate::types::{RetrievalQuery, RetrievalStrategy, RetrievedDocument};

const K1: f64 = 1.2;
const B: f64 = 0.75;

pub struct LexicalStrategy {
    kb: Arc<KnowledgeBase>,
    index: TermIndex,
}

impl LexicalStrategy {
    pub const NAME: &'static str = "lexical";

    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        let index = TermIndex::build(kb.documents().iter().map(|d| d.text.as_str()));
        Self { kb, index }
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.index.len() as f64;
        let df = self.index.df(term) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, terms: &[String], unit: usize) -> f64 {
        let counts = &self.index.term_counts[unit];
        let len_norm = if self.index.avg_len > 0.0 {
            self.index.lengths[unit] as f64 / self.index.avg_len
        } else {
            1.0
        };
        terms
            .iter()
            .filter_map(|t| counts.get(t).map(|&tf| (t, tf as f64)))
            .map(|(t, tf)| self.idf(t) * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * len_norm)))
            .sum()
    }
}

#[async_trait]
impl RetrievalStrategy for LexicalStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
        let mut terms = tokenize(&query.text);
        terms.sort();
        terms.dedup();

        let mut scored: Vec<(usize, f64)> = self
            .kb
            .documents()
            .iter()
            .enumerate()
            .filter(|(_, doc)| query.matches(&doc.metadata))
            .map(|(i, _)| (i, self.score(&terms, i)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(query.top_k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| {
                let doc = &self.kb.documents()[i];
                RetrievedDocument::new(&doc.id, &doc.text, score, Self::NAME)
                    .with_metadata(doc.metadata.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::{ChunkingOptions, KbDocument};

    fn kb() -> Arc<KnowledgeBase> {
        Arc::new(KnowledgeBase::from_documents(
            vec![
                KbDocument::new(
                    "pool",
                    "pool.md",
                    "# Connection pool exhausted\nService: api\n\nThe database connection pool was exhausted under load.",
                ),
                KbDocument::new(
                    "dns",
                    "dns.md",
                    "# DNS outage\nService: edge\n\nResolvers returned SERVFAIL for internal zones.",
                ),
                KbDocument::new(
                    "cert",
                    "cert.md",
                    "# Expired certificate\nService: edge\n\nTLS handshake failed after the certificate expired.",
                ),
            ],
            ChunkingOptions::default(),
        ))
    }

    #[tokio::test]
    async fn ranks_matching_document_first() {
        let strategy = LexicalStrategy::new(kb());
        let hits = strategy
            .query(&RetrievalQuery::new("database connection pool exhausted", 5))
            .await
            .unwrap();
        assert_eq!(hits[0].id, "pool");
        assert_eq!(hits[0].strategy, "lexical");
        assert!(hits.iter().all(|h| h.score > 0.0));
    }

    #[tokio::test]
    async fn no_overlap_returns_nothing() {
        let strategy = LexicalStrategy::new(kb());
        let hits = strategy
            .query(&RetrievalQuery::new("kubernetes eviction", 5))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn filters_restrict_candidates() {
        let strategy = LexicalStrategy::new(kb());
        let query = RetrievalQuery::new("certificate expired servfail", 5).with_filter("service", "edge");
        let hits = strategy.query(&query).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.metadata["service"] == "edge"));
    }
}
