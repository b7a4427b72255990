//! Multi-query retrieval: run alternative phrasings against a base strategy
//! and union the hits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use oncall_shared::{OncallError, Result};

use crate::types::{QueryExpander, RetrievalQuery, RetrievalStrategy, RetrievedDocument};

pub struct MultiQueryStrategy {
    base: Arc<dyn RetrievalStrategy>,
    expander: Arc<dyn QueryExpander>,
    variants: usize,
}

impl MultiQueryStrategy {
    pub const NAME: &'static str = "multi_query";

    pub fn new(
        base: Arc<dyn RetrievalStrategy>,
        expander: Arc<dyn QueryExpander>,
        variants: usize,
    ) -> Self {
        Self {
            base,
            expander,
            variants,
        }
    }

    /// The original query first, then distinct non-empty variants.
    async fn phrasings(&self, text: &str) -> Vec<String> {
        let mut phrasings = vec![text.to_string()];
        if self.variants == 0 {
            return phrasings;
        }
        match self.expander.expand(text, self.variants).await {
            Ok(variants) => {
                for v in variants.into_iter().map(|v| v.trim().to_string()) {
                    if !v.is_empty() && !phrasings.contains(&v) {
                        phrasings.push(v);
                    }
                    if phrasings.len() > self.variants {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "query expansion failed, using original query only");
            }
        }
        phrasings
    }
}

#[async_trait]
impl RetrievalStrategy for MultiQueryStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
        let phrasings = self.phrasings(&query.text).await;
        debug!(count = phrasings.len(), "running query phrasings");

        let queries: Vec<RetrievalQuery> = phrasings
            .iter()
            .map(|p| query.derive(p.as_str(), query.top_k))
            .collect();
        let runs = join_all(queries.iter().map(|q| self.base.query(q))).await;

        let mut failures = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut union: Vec<RetrievedDocument> = Vec::new();
        for run in runs {
            match run {
                Ok(hits) => {
                    for hit in hits {
                        match index.get(&hit.id) {
                            Some(&slot) => {
                                if hit.score > union[slot].score {
                                    union[slot].score = hit.score;
                                }
                            }
                            None => {
                                index.insert(hit.id.clone(), union.len());
                                union.push(hit);
                            }
                        }
                    }
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.len() == phrasings.len() {
            return Err(OncallError::retrieval(
                Self::NAME,
                format!("every phrasing failed: {}", failures.join("; ")),
            ));
        }

        union.sort_by(|a, b| b.score.total_cmp(&a.score));
        union.truncate(query.top_k);
        for hit in &mut union {
            hit.strategy = Self::NAME.to_string();
        }
        Ok(union)
    }
}
