//! Weighted score fusion across strategy result sets.
//!
//! Each set is min-max normalized on its own, reduced to one entry per
//! logical document (maximum normalized score), then weighted and summed.
//! The output order is fully determined by the inputs: fused score
//! descending, ties kept in first-seen order (set order, then rank).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use oncall_shared::{OncallError, Result, RetrievalConfig};

use crate::types::{RetrievedDocument, StrategyResults};

pub const LEXICAL: &str = "lexical";
pub const SEMANTIC: &str = "semantic";

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

/// Strategy name → non-negative weight. Never all zero.
#[derive(Debug, Clone, PartialEq)]
pub struct FusionWeights {
    weights: BTreeMap<String, f64>,
}

impl FusionWeights {
    /// Validated constructor.
    pub fn new(weights: BTreeMap<String, f64>) -> Result<Self> {
        if weights.is_empty() {
            return Err(OncallError::validation("fusion weights are empty"));
        }
        for (name, w) in &weights {
            if !w.is_finite() || *w < 0.0 {
                return Err(OncallError::validation(format!(
                    "weight for '{name}' must be a non-negative number, got {w}"
                )));
            }
        }
        if weights.values().all(|w| *w == 0.0) {
            return Err(OncallError::validation("fusion weights must not all be zero"));
        }
        Ok(Self { weights })
    }

    /// `{lexical: 0.3, semantic: 0.7}`.
    pub fn hybrid() -> Self {
        Self {
            weights: BTreeMap::from([(LEXICAL.to_string(), 0.3), (SEMANTIC.to_string(), 0.7)]),
        }
    }

    /// Equal weight `1/N` across `strategies`.
    pub fn ensemble<S: AsRef<str>>(strategies: &[S]) -> Result<Self> {
        if strategies.is_empty() {
            return Err(OncallError::validation("ensemble needs at least one strategy"));
        }
        let w = 1.0 / strategies.len() as f64;
        Self::new(
            strategies
                .iter()
                .map(|s| (s.as_ref().to_string(), w))
                .collect(),
        )
    }

    /// Weight 1.0 on one strategy.
    pub fn single(strategy: impl Into<String>) -> Self {
        Self {
            weights: BTreeMap::from([(strategy.into(), 1.0)]),
        }
    }

    /// Resolve a named preset: `hybrid`, `ensemble`, or a strategy name.
    pub fn preset<S: AsRef<str>>(name: &str, available: &[S]) -> Result<Self> {
        match name {
            "hybrid" => Ok(Self::hybrid()),
            "ensemble" => Self::ensemble(available),
            other if available.iter().any(|s| s.as_ref() == other) => Ok(Self::single(other)),
            other => Err(OncallError::validation(format!(
                "unknown retrieval preset '{other}'"
            ))),
        }
    }

    /// Explicit `[retrieval.weights]` win over `preset`.
    pub fn from_config<S: AsRef<str>>(config: &RetrievalConfig, available: &[S]) -> Result<Self> {
        if config.weights.is_empty() {
            Self::preset(&config.preset, available)
        } else {
            Self::new(config.weights.clone())
        }
    }

    pub fn weight(&self, strategy: &str) -> f64 {
        self.weights.get(strategy).copied().unwrap_or(0.0)
    }

    /// Sum of all weights: the largest fused score a document can reach.
    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    /// Strategies with a non-zero weight.
    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.weights
            .iter()
            .filter(|(_, w)| **w > 0.0)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

// ---------------------------------------------------------------------------
// Fusion
// ---------------------------------------------------------------------------

/// Min-max normalize scores into `[0, 1]`.
///
/// A set whose scores are all equal (including a single hit) maps to 1.0.
/// Non-finite scores map to 0.0.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let finite = scores.iter().copied().filter(|s| s.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        (lo.min(s), hi.max(s))
    });
    let range = max - min;

    scores
        .iter()
        .map(|s| {
            if !s.is_finite() {
                0.0
            } else if range <= f64::EPSILON {
                1.0
            } else {
                (s - min) / range
            }
        })
        .collect()
}

struct Accumulator {
    document: RetrievedDocument,
    fused: f64,
}

/// Fuse strategy result sets into one ranking of at most `top_k` documents.
///
/// Zero-weight and empty sets contribute nothing. Output documents carry the
/// logical id as `id` and their fused score in `fused_score`; the rest of
/// each document is taken from its first occurrence.
pub fn fuse(
    results: &[StrategyResults],
    weights: &FusionWeights,
    top_k: usize,
) -> Vec<RetrievedDocument> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Accumulator> = Vec::new();

    for set in results {
        let weight = weights.weight(&set.strategy);
        if weight <= 0.0 || set.documents.is_empty() {
            continue;
        }

        let scores: Vec<f64> = set.documents.iter().map(|d| d.score).collect();
        let normalized = normalize(&scores);

        // One contribution per logical id within this set: its best chunk.
        let mut best: Vec<(&RetrievedDocument, f64)> = Vec::new();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (doc, n) in set.documents.iter().zip(normalized) {
            match seen.get(doc.logical_id()) {
                Some(&slot) => {
                    if n > best[slot].1 {
                        best[slot].1 = n;
                    }
                }
                None => {
                    seen.insert(doc.logical_id(), best.len());
                    best.push((doc, n));
                }
            }
        }

        for (doc, n) in best {
            let contribution = weight * n;
            match index.get(doc.logical_id()) {
                Some(&slot) => merged[slot].fused += contribution,
                None => {
                    let mut document = doc.clone();
                    if let Some(parent) = document.parent_id.take() {
                        document.id = parent;
                    }
                    index.insert(document.id.clone(), merged.len());
                    merged.push(Accumulator {
                        document,
                        fused: contribution,
                    });
                }
            }
        }
    }

    // Stable sort keeps first-seen order among equal scores.
    merged.sort_by(|a, b| b.fused.total_cmp(&a.fused));
    merged.truncate(top_k);

    merged
        .into_iter()
        .map(|acc| {
            let mut doc = acc.document;
            doc.fused_score = acc.fused;
            doc
        })
        .collect()
}

/// Order in a merged ranking: reranked documents first by rerank score,
/// then the rest by fused score.
fn merge_order(a: &RetrievedDocument, b: &RetrievedDocument) -> Ordering {
    match (a.rerank_score, b.rerank_score) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.fused_score.total_cmp(&a.fused_score),
    }
}

/// Merge several final rankings (one per query), one entry per document.
///
/// A single ranking is returned in its own order, reranked or not. With
/// several, duplicates keep their better entry and reranked documents lead.
pub fn merge_rankings(
    mut rankings: Vec<Vec<RetrievedDocument>>,
    top_k: usize,
) -> Vec<RetrievedDocument> {
    if rankings.len() == 1 {
        let mut only = rankings.remove(0);
        only.truncate(top_k);
        return only;
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<RetrievedDocument> = Vec::new();

    for doc in rankings.into_iter().flatten() {
        match index.get(doc.logical_id()) {
            Some(&slot) => {
                if merge_order(&doc, &merged[slot]) == Ordering::Less {
                    merged[slot] = doc;
                }
            }
            None => {
                index.insert(doc.logical_id().to_string(), merged.len());
                merged.push(doc);
            }
        }
    }

    merged.sort_by(merge_order);
    merged.truncate(top_k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, score: f64, strategy: &str) -> RetrievedDocument {
        RetrievedDocument::new(id, format!("text of {id}"), score, strategy)
    }

    fn set(strategy: &str, hits: &[(&str, f64)]) -> StrategyResults {
        StrategyResults::new(
            strategy,
            hits.iter().map(|(id, s)| doc(id, *s, strategy)).collect(),
        )
    }

    fn ids(docs: &[RetrievedDocument]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    #[test]
    fn normalize_min_max() {
        assert_eq!(normalize(&[10.0, 5.0, 0.0]), vec![1.0, 0.5, 0.0]);
        assert_eq!(normalize(&[3.0, 3.0]), vec![1.0, 1.0]);
        assert_eq!(normalize(&[42.0]), vec![1.0]);
        assert!(normalize(&[]).is_empty());
        assert_eq!(normalize(&[f64::NAN, 2.0, 1.0]), vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn weighted_union() {
        let weights = FusionWeights::hybrid();
        let lexical = set("lexical", &[("a", 8.0), ("b", 4.0), ("c", 0.0)]);
        let semantic = set("semantic", &[("c", 0.9), ("d", 0.1)]);

        let fused = fuse(&[lexical, semantic], &weights, 10);
        assert_eq!(ids(&fused), vec!["c", "a", "b", "d"]);
        // c: 0.3 * 0.0 + 0.7 * 1.0
        assert!((fused[0].fused_score - 0.7).abs() < 1e-9);
        assert!((fused[1].fused_score - 0.3).abs() < 1e-9);
        assert!((fused[2].fused_score - 0.15).abs() < 1e-9);
        assert_eq!(fused[3].fused_score, 0.0);
    }

    #[test]
    fn fusion_is_deterministic() {
        let weights = FusionWeights::ensemble(&["lexical", "semantic"]).unwrap();
        let inputs = vec![
            set("lexical", &[("x", 1.0), ("y", 1.0), ("z", 0.5)]),
            set("semantic", &[("y", 2.0), ("w", 2.0)]),
        ];
        let first = fuse(&inputs, &weights, 10);
        for _ in 0..10 {
            assert_eq!(fuse(&inputs, &weights, 10), first);
        }
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let weights = FusionWeights::ensemble(&["lexical", "semantic"]).unwrap();
        let inputs = vec![
            set("lexical", &[("p", 5.0), ("q", 5.0)]),
            set("semantic", &[("r", 1.0), ("s", 1.0)]),
        ];
        let fused = fuse(&inputs, &weights, 10);
        assert_eq!(ids(&fused), vec!["p", "q", "r", "s"]);
    }

    #[test]
    fn empty_set_changes_nothing() {
        let weights = FusionWeights::ensemble(&["lexical", "semantic"]).unwrap();
        let a = set("lexical", &[("a", 3.0), ("b", 1.0)]);
        let alone = fuse(std::slice::from_ref(&a), &weights, 10);
        let with_empty = fuse(&[a, StrategyResults::empty("semantic")], &weights, 10);
        assert_eq!(alone, with_empty);
    }

    #[test]
    fn child_chunks_collapse_to_parent_max() {
        let weights = FusionWeights::single("parent_document");
        let chunks = StrategyResults::new(
            "parent_document",
            vec![
                doc("kafka#0", 0.9, "parent_document").with_parent("kafka"),
                doc("dns#2", 0.5, "parent_document").with_parent("dns"),
                doc("kafka#4", 0.7, "parent_document").with_parent("kafka"),
                doc("tls#1", 0.1, "parent_document").with_parent("tls"),
            ],
        );

        let fused = fuse(&[chunks], &weights, 10);
        assert_eq!(ids(&fused), vec!["kafka", "dns", "tls"]);
        // max child normalized score (1.0), not the sum of 1.0 and 0.75
        assert!((fused[0].fused_score - 1.0).abs() < 1e-9);
        assert!(fused.iter().all(|d| d.parent_id.is_none()));
    }

    #[test]
    fn zero_semantic_weight_equals_lexical_ranking() {
        let weights = FusionWeights::new(BTreeMap::from([
            ("lexical".to_string(), 1.0),
            ("semantic".to_string(), 0.0),
        ]))
        .unwrap();
        let lexical = set("lexical", &[("l1", 9.0), ("l2", 7.0), ("l3", 7.0), ("l4", 1.0)]);
        let semantic = set("semantic", &[("s1", 0.99), ("l4", 0.98)]);

        let fused = fuse(&[lexical, semantic], &weights, 10);
        assert_eq!(ids(&fused), vec!["l1", "l2", "l3", "l4"]);
    }

    #[test]
    fn disjoint_equal_weights_pick_highest_normalized() {
        let names = ["a", "b", "c", "d", "e"];
        let weights = FusionWeights::ensemble(&names).unwrap();

        // Each strategy: five disjoint docs with normalized scores 1, .75, .5, .25, 0.
        let inputs: Vec<StrategyResults> = names
            .iter()
            .map(|s| {
                let hits: Vec<(String, f64)> = (0..5)
                    .map(|i| (format!("{s}{i}"), 4.0 - i as f64))
                    .collect();
                StrategyResults::new(
                    *s,
                    hits.iter().map(|(id, sc)| doc(id, *sc, s)).collect(),
                )
            })
            .collect();

        let fused = fuse(&inputs, &weights, 5);
        // Top normalized score (1.0) belongs to the first hit of every strategy.
        assert_eq!(ids(&fused), vec!["a0", "b0", "c0", "d0", "e0"]);
        assert!(fused.iter().all(|d| (d.fused_score - 0.2).abs() < 1e-9));
    }

    #[test]
    fn truncates_to_top_k() {
        let weights = FusionWeights::single("lexical");
        let fused = fuse(
            &[set("lexical", &[("a", 3.0), ("b", 2.0), ("c", 1.0)])],
            &weights,
            2,
        );
        assert_eq!(ids(&fused), vec!["a", "b"]);
    }

    #[test]
    fn weights_validation() {
        assert!(FusionWeights::new(BTreeMap::new()).is_err());
        assert!(FusionWeights::new(BTreeMap::from([("a".to_string(), 0.0)])).is_err());
        assert!(FusionWeights::new(BTreeMap::from([("a".to_string(), -1.0)])).is_err());
        assert!(FusionWeights::new(BTreeMap::from([("a".to_string(), f64::NAN)])).is_err());
        assert!(FusionWeights::new(BTreeMap::from([
            ("a".to_string(), 0.0),
            ("b".to_string(), 2.0)
        ]))
        .is_ok());
    }

    #[test]
    fn presets_resolve() {
        let available = ["lexical", "semantic", "parent_document"];
        let ensemble = FusionWeights::preset("ensemble", &available).unwrap();
        assert!((ensemble.weight("parent_document") - 1.0 / 3.0).abs() < 1e-9);

        let single = FusionWeights::preset("semantic", &available).unwrap();
        assert_eq!(single.weight("semantic"), 1.0);
        assert_eq!(single.weight("lexical"), 0.0);

        assert!(FusionWeights::preset("bogus", &available).is_err());
        assert_eq!(FusionWeights::hybrid().total(), 1.0);
    }

    #[test]
    fn merge_keeps_best_score_per_document() {
        let mut a = doc("a", 1.0, "lexical");
        a.fused_score = 0.4;
        let mut a2 = doc("a", 1.0, "lexical");
        a2.fused_score = 0.9;
        let mut b = doc("b", 1.0, "lexical");
        b.fused_score = 0.5;

        let merged = merge_rankings(vec![vec![a, b], vec![a2]], 5);
        assert_eq!(ids(&merged), vec!["a", "b"]);
        assert_eq!(merged[0].fused_score, 0.9);
    }

    #[test]
    fn merge_puts_reranked_documents_first() {
        let mut a = doc("a", 1.0, "lexical");
        a.fused_score = 0.9;
        let mut b = doc("b", 1.0, "lexical");
        b.fused_score = 0.5;
        b.rerank_score = Some(0.2);
        let mut c = doc("c", 1.0, "lexical");
        c.fused_score = 0.3;
        c.rerank_score = Some(0.8);
        let mut a_plain = doc("a", 1.0, "lexical");
        a_plain.fused_score = 0.95;

        let merged = merge_rankings(vec![vec![c, b, a], vec![a_plain]], 5);
        assert_eq!(ids(&merged), vec!["c", "b", "a"]);
        assert_eq!(merged[2].fused_score, 0.95);
    }

    #[test]
    fn single_ranking_keeps_its_order() {
        let mut a = doc("a", 1.0, "lexical");
        a.fused_score = 0.9;
        let mut b = doc("b", 1.0, "lexical");
        b.fused_score = 0.1;
        b.rerank_score = Some(0.7);

        let merged = merge_rankings(vec![vec![b, a]], 1);
        assert_eq!(ids(&merged), vec!["b"]);
    }
}
