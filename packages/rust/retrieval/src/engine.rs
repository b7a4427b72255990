//! The retrieval engine: run strategies concurrently, fuse, optionally rerank.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{info, instrument, warn};

use oncall_shared::{OncallError, RerankerConfig, Result, RetrievalConfig};

use crate::fusion::{FusionWeights, fuse, merge_rankings};
use crate::kb::KnowledgeBase;
use crate::rerank::{Reranker, apply_rerank};
use crate::strategies::{
    LexicalStrategy, MultiQueryStrategy, ParentDocumentStrategy, SemanticStrategy,
};
use crate::types::{QueryExpander, RetrievalQuery, RetrievalStrategy, RetrievedDocument, StrategyResults};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Depth requested from each strategy before fusion.
    pub candidates_per_strategy: usize,
    pub strategy_timeout: Duration,
    pub rerank_top_n: usize,
    pub rerank_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default(), &RerankerConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(retrieval: &RetrievalConfig, reranker: &RerankerConfig) -> Self {
        Self {
            candidates_per_strategy: retrieval.candidates_per_strategy,
            strategy_timeout: retrieval.strategy_timeout(),
            rerank_top_n: reranker.top_n,
            rerank_timeout: reranker.timeout(),
        }
    }
}

/// Fused ranking plus what went wrong along the way.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub documents: Vec<RetrievedDocument>,
    /// Sum of weights used; the ceiling for any fused score.
    pub total_weight: f64,
    /// Human-readable notes for failed strategies or reranker fallback.
    pub degraded: Vec<String>,
}

impl RetrievalOutcome {
    /// Best fused score scaled into `[0, 1]`. Reranking may move that
    /// document off the head, so this scans the whole ranking.
    pub fn top_confidence(&self) -> f64 {
        let best = self
            .documents
            .iter()
            .map(|d| d.fused_score)
            .filter(|s| s.is_finite())
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));
        match best {
            Some(top) if self.total_weight > 0.0 => (top / self.total_weight).clamp(0.0, 1.0),
            _ => 0.0,
        }
    }
}

pub struct RetrievalEngine {
    strategies: Vec<Arc<dyn RetrievalStrategy>>,
    reranker: Option<Arc<dyn Reranker>>,
    options: EngineOptions,
}

impl RetrievalEngine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            strategies: Vec::new(),
            reranker: None,
            options,
        }
    }

    /// Register a strategy. Names must be unique; a later registration
    /// replaces an earlier one with the same name.
    pub fn with_strategy(mut self, strategy: Arc<dyn RetrievalStrategy>) -> Self {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Engine over a local knowledge base with every built-in strategy.
    /// `multi_query` is only registered when an expander is supplied.
    pub fn builtin(
        kb: Arc<KnowledgeBase>,
        options: EngineOptions,
        expander: Option<(Arc<dyn QueryExpander>, usize)>,
    ) -> Self {
        let semantic: Arc<dyn RetrievalStrategy> = Arc::new(SemanticStrategy::new(Arc::clone(&kb)));
        let mut engine = Self::new(options)
            .with_strategy(Arc::new(LexicalStrategy::new(Arc::clone(&kb))))
            .with_strategy(Arc::clone(&semantic))
            .with_strategy(Arc::new(ParentDocumentStrategy::new(kb)));
        if let Some((expander, variants)) = expander {
            engine = engine.with_strategy(Arc::new(MultiQueryStrategy::new(
                semantic, expander, variants,
            )));
        }
        engine
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Resolve configured weights against the registered strategies.
    pub fn weights_from_config(&self, config: &RetrievalConfig) -> Result<FusionWeights> {
        FusionWeights::from_config(config, &self.strategy_names())
    }

    /// Run every strategy with a non-zero weight, fuse, then rerank.
    ///
    /// Strategy failures and timeouts contribute an empty result set and a
    /// note in `degraded`; they never fail the call.
    #[instrument(skip_all, fields(query_len = query.text.len(), top_k = query.top_k))]
    pub async fn retrieve(
        &self,
        query: &RetrievalQuery,
        weights: &FusionWeights,
    ) -> Result<RetrievalOutcome> {
        let start = Instant::now();

        for name in weights.active() {
            if !self.strategies.iter().any(|s| s.name() == name) {
                return Err(OncallError::validation(format!(
                    "weight given for unregistered strategy '{name}'"
                )));
            }
        }

        let active: Vec<&Arc<dyn RetrievalStrategy>> = self
            .strategies
            .iter()
            .filter(|s| weights.weight(s.name()) > 0.0)
            .collect();

        // Fetch deep enough that the reranker sees its full head.
        let depth = match self.reranker {
            Some(_) => query.top_k.max(self.options.rerank_top_n),
            None => query.top_k,
        };
        let sub_query = query.derive(
            query.text.as_str(),
            self.options.candidates_per_strategy.max(depth),
        );

        let timeout = self.options.strategy_timeout;
        let runs = join_all(active.iter().map(|strategy| {
            let sub_query = &sub_query;
            async move {
                match tokio::time::timeout(timeout, strategy.query(sub_query)).await {
                    Ok(result) => result,
                    Err(_) => Err(OncallError::timeout(
                        format!("strategy {}", strategy.name()),
                        timeout,
                    )),
                }
            }
        }))
        .await;

        let mut degraded = Vec::new();
        let mut results = Vec::with_capacity(runs.len());
        for (strategy, result) in active.iter().zip(runs) {
            let name = strategy.name();
            match result {
                Ok(mut docs) => {
                    docs.retain(|d| query.matches(&d.metadata));
                    results.push(StrategyResults::new(name, docs));
                }
                Err(e) => {
                    warn!(strategy = name, error = %e, "strategy failed, contributing empty set");
                    degraded.push(format!("Retrieval strategy '{name}' unavailable: {e}"));
                    results.push(StrategyResults::empty(name));
                }
            }
        }

        let mut documents = fuse(&results, weights, depth);

        if let Some(reranker) = &self.reranker {
            let outcome = apply_rerank(
                reranker.as_ref(),
                &query.text,
                documents,
                self.options.rerank_top_n,
                self.options.rerank_timeout,
            )
            .await;
            documents = outcome.documents;
            degraded.extend(outcome.fallback);
        }
        documents.truncate(query.top_k);

        info!(
            strategies = results.len(),
            returned = documents.len(),
            degraded = degraded.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "retrieval complete"
        );

        Ok(RetrievalOutcome {
            documents,
            total_weight: weights.total(),
            degraded,
        })
    }

    /// Run several queries and merge their final rankings. Reranked order
    /// survives the merge.
    pub async fn retrieve_many(
        &self,
        queries: &[RetrievalQuery],
        weights: &FusionWeights,
    ) -> Result<RetrievalOutcome> {
        let top_k = queries.iter().map(|q| q.top_k).max().unwrap_or(0);
        let outcomes = join_all(queries.iter().map(|q| self.retrieve(q, weights))).await;

        let mut rankings = Vec::with_capacity(outcomes.len());
        let mut degraded: Vec<String> = Vec::new();
        for outcome in outcomes {
            let outcome = outcome?;
            for note in outcome.degraded {
                if !degraded.contains(&note) {
                    degraded.push(note);
                }
            }
            rankings.push(outcome.documents);
        }

        Ok(RetrievalOutcome {
            documents: merge_rankings(rankings, top_k),
            total_weight: weights.total(),
            degraded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kb::{ChunkingOptions, KbDocument};
    use crate::rerank::RerankHit;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct Fixed {
        name: &'static str,
        hits: Vec<(&'static str, f64)>,
    }

    #[async_trait]
    impl RetrievalStrategy for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        async fn query(&self, _q: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
            Ok(self
                .hits
                .iter()
                .map(|(id, s)| RetrievedDocument::new(*id, *id, *s, self.name))
                .collect())
        }
    }

    struct Failing;

    #[async_trait]
    impl RetrievalStrategy for Failing {
        fn name(&self) -> &str {
            "semantic"
        }
        async fn query(&self, _q: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
            Err(OncallError::retrieval("semantic", "vector store unreachable"))
        }
    }

    struct Hanging;

    #[async_trait]
    impl RetrievalStrategy for Hanging {
        fn name(&self) -> &str {
            "semantic"
        }
        async fn query(&self, _q: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![])
        }
    }

    struct Reverse;

    #[async_trait]
    impl Reranker for Reverse {
        fn name(&self) -> &str {
            "reverse"
        }
        async fn rerank(&self, _q: &str, c: &[&str]) -> Result<Vec<RerankHit>> {
            Ok((0..c.len())
                .rev()
                .map(|i| RerankHit { index: i, score: i as f64 })
                .collect())
        }
    }

    fn lexical() -> Arc<dyn RetrievalStrategy> {
        Arc::new(Fixed {
            name: "lexical",
            hits: vec![("a", 3.0), ("b", 2.0), ("c", 1.0)],
        })
    }

    fn fast_options() -> EngineOptions {
        EngineOptions {
            strategy_timeout: Duration::from_millis(50),
            ..EngineOptions::default()
        }
    }

    fn ids(outcome: &RetrievalOutcome) -> Vec<&str> {
        outcome.documents.iter().map(|d| d.id.as_str()).collect()
    }

    #[tokio::test]
    async fn failing_strategy_degrades_to_remaining() {
        let engine = RetrievalEngine::new(fast_options())
            .with_strategy(lexical())
            .with_strategy(Arc::new(Failing));

        let outcome = engine
            .retrieve(&RetrievalQuery::new("q", 5), &FusionWeights::hybrid())
            .await
            .unwrap();
        assert_eq!(ids(&outcome), vec!["a", "b", "c"]);
        assert_eq!(outcome.degraded.len(), 1);
        assert!(outcome.degraded[0].contains("semantic"));
    }

    #[tokio::test]
    async fn hanging_strategy_times_out() {
        let engine = RetrievalEngine::new(fast_options())
            .with_strategy(lexical())
            .with_strategy(Arc::new(Hanging));

        let outcome = engine
            .retrieve(&RetrievalQuery::new("q", 5), &FusionWeights::hybrid())
            .await
            .unwrap();
        assert_eq!(ids(&outcome), vec!["a", "b", "c"]);
        assert!(outcome.degraded[0].contains("timed out"));
    }

    #[tokio::test]
    async fn zero_weight_strategy_is_not_run() {
        let weights = FusionWeights::new(BTreeMap::from([
            ("lexical".to_string(), 1.0),
            ("semantic".to_string(), 0.0),
        ]))
        .unwrap();
        let engine = RetrievalEngine::new(fast_options())
            .with_strategy(lexical())
            .with_strategy(Arc::new(Failing));

        let outcome = engine.retrieve(&RetrievalQuery::new("q", 5), &weights).await.unwrap();
        assert!(outcome.degraded.is_empty());
        assert_eq!(ids(&outcome), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn unknown_weighted_strategy_is_rejected() {
        let engine = RetrievalEngine::new(fast_options()).with_strategy(lexical());
        let err = engine
            .retrieve(&RetrievalQuery::new("q", 5), &FusionWeights::single("semantic"))
            .await
            .unwrap_err();
        assert!(matches!(err, OncallError::Validation { .. }));
    }

    #[tokio::test]
    async fn reranker_reorders_head_then_truncates() {
        let engine = RetrievalEngine::new(EngineOptions {
            rerank_top_n: 3,
            ..fast_options()
        })
        .with_strategy(lexical())
        .with_reranker(Arc::new(Reverse));

        let outcome = engine
            .retrieve(&RetrievalQuery::new("q", 2), &FusionWeights::single("lexical"))
            .await
            .unwrap();
        assert_eq!(ids(&outcome), vec!["c", "b"]);
        assert!(outcome.documents[0].rerank_score.is_some());
    }

    #[tokio::test]
    async fn top_confidence_is_normalized() {
        let engine = RetrievalEngine::new(fast_options()).with_strategy(lexical());
        let outcome = engine
            .retrieve(&RetrievalQuery::new("q", 5), &FusionWeights::single("lexical"))
            .await
            .unwrap();
        assert!((outcome.top_confidence() - 1.0).abs() < 1e-9);
        assert_eq!(RetrievalOutcome::default().top_confidence(), 0.0);
    }

    #[tokio::test]
    async fn builtin_engine_over_knowledge_base() {
        let kb = Arc::new(KnowledgeBase::from_documents(
            vec![
                KbDocument::new(
                    "pool",
                    "pool.md",
                    "# Connection pool exhausted\n\nThe database connection pool was exhausted during the sale.",
                ),
                KbDocument::new(
                    "dns",
                    "dns.md",
                    "# DNS outage\n\nResolvers returned SERVFAIL for internal zones.",
                ),
            ],
            ChunkingOptions::default(),
        ));
        let engine = RetrievalEngine::builtin(kb, fast_options(), None);
        assert_eq!(engine.strategy_names(), vec!["lexical", "semantic", "parent_document"]);

        let weights = FusionWeights::preset("ensemble", &engine.strategy_names()).unwrap();
        let outcome = engine
            .retrieve(&RetrievalQuery::new("database connection pool exhausted", 5), &weights)
            .await
            .unwrap();
        assert_eq!(outcome.documents[0].id, "pool");
        // lexical, semantic and parent_document hits for "pool" collapse into one entry
        assert_eq!(
            outcome.documents.iter().filter(|d| d.id == "pool").count(),
            1
        );
    }

    #[tokio::test]
    async fn retrieve_many_merges_queries() {
        let engine = RetrievalEngine::new(fast_options()).with_strategy(lexical());
        let queries = vec![RetrievalQuery::new("one", 2), RetrievalQuery::new("two", 2)];
        let outcome = engine
            .retrieve_many(&queries, &FusionWeights::single("lexical"))
            .await
            .unwrap();
        assert_eq!(ids(&outcome), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn retrieve_many_keeps_reranked_order() {
        let engine = RetrievalEngine::new(EngineOptions {
            rerank_top_n: 3,
            ..fast_options()
        })
        .with_strategy(lexical())
        .with_reranker(Arc::new(Reverse));
        let weights = FusionWeights::single("lexical");

        let single = engine.retrieve(&RetrievalQuery::new("q", 3), &weights).await.unwrap();
        let one = engine
            .retrieve_many(&[RetrievalQuery::new("q", 3)], &weights)
            .await
            .unwrap();
        assert_eq!(ids(&single), vec!["c", "b", "a"]);
        assert_eq!(ids(&one), ids(&single));

        let queries = vec![RetrievalQuery::new("one", 3), RetrievalQuery::new("two", 3)];
        let many = engine.retrieve_many(&queries, &weights).await.unwrap();
        assert_eq!(ids(&many), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn top_confidence_uses_best_fused_score_after_rerank() {
        let engine = RetrievalEngine::new(EngineOptions {
            rerank_top_n: 3,
            ..fast_options()
        })
        .with_strategy(lexical())
        .with_reranker(Arc::new(Reverse));

        let outcome = engine
            .retrieve(&RetrievalQuery::new("q", 3), &FusionWeights::single("lexical"))
            .await
            .unwrap();
        assert_eq!(outcome.documents[0].id, "c");
        assert!((outcome.top_confidence() - 1.0).abs() < 1e-9);
    }
}
