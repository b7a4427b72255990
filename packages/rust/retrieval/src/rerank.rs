//! Optional reranking of the fused head.
//!
//! Only the first `top_n` fused candidates are sent to the reranker. Any
//! failure (transport error, timeout, out-of-range or duplicate indices)
//! leaves the fused order untouched.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use oncall_shared::{OncallError, RerankerConfig, Result, resolve_api_key};

use crate::types::RetrievedDocument;

/// One reranked candidate: position in the submitted list plus its score.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    #[serde(alias = "relevance_score")]
    pub score: f64,
}

/// `(query, candidate texts) -> reordered indices with scores`.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    /// Hits best first. Candidates left out keep their relative order
    /// after the returned ones.
    async fn rerank(&self, query: &str, candidates: &[&str]) -> Result<Vec<RerankHit>>;
}

/// Result of [`apply_rerank`].
#[derive(Debug)]
pub struct RerankOutcome {
    pub documents: Vec<RetrievedDocument>,
    /// Set when the reranker failed and the fused order was kept.
    pub fallback: Option<String>,
}

/// Rerank the first `top_n` of `documents`, keeping the tail as is.
#[instrument(skip_all, fields(reranker = reranker.name(), candidates = documents.len()))]
pub async fn apply_rerank(
    reranker: &dyn Reranker,
    query: &str,
    documents: Vec<RetrievedDocument>,
    top_n: usize,
    timeout: Duration,
) -> RerankOutcome {
    let head_len = top_n.min(documents.len());
    if head_len == 0 {
        return RerankOutcome {
            documents,
            fallback: None,
        };
    }

    let texts: Vec<&str> = documents[..head_len].iter().map(|d| d.text.as_str()).collect();
    let call = tokio::time::timeout(timeout, reranker.rerank(query, &texts)).await;
    let hits = match call {
        Ok(Ok(hits)) => validate_hits(hits, head_len),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(OncallError::Rerank(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    };

    match hits {
        Ok(hits) => {
            debug!(reranked = hits.len(), "rerank applied");
            RerankOutcome {
                documents: reorder(documents, head_len, &hits),
                fallback: None,
            }
        }
        Err(e) => {
            warn!(error = %e, "rerank failed, keeping fused order");
            RerankOutcome {
                documents,
                fallback: Some(format!("Reranker unavailable ({e}); fused order kept")),
            }
        }
    }
}

fn validate_hits(hits: Vec<RerankHit>, head_len: usize) -> Result<Vec<RerankHit>> {
    let mut seen = HashSet::new();
    for hit in &hits {
        if hit.index >= head_len {
            return Err(OncallError::Rerank(format!(
                "index {} out of range for {head_len} candidates",
                hit.index
            )));
        }
        if !seen.insert(hit.index) {
            return Err(OncallError::Rerank(format!("duplicate index {}", hit.index)));
        }
        if !hit.score.is_finite() {
            return Err(OncallError::Rerank(format!(
                "non-finite score for index {}",
                hit.index
            )));
        }
    }
    Ok(hits)
}

fn reorder(
    documents: Vec<RetrievedDocument>,
    head_len: usize,
    hits: &[RerankHit],
) -> Vec<RetrievedDocument> {
    let mut slots: Vec<Option<RetrievedDocument>> = documents.into_iter().map(Some).collect();
    let mut out = Vec::with_capacity(slots.len());

    for hit in hits {
        if let Some(mut doc) = slots[hit.index].take() {
            doc.rerank_score = Some(hit.score);
            out.push(doc);
        }
    }
    // Unscored head candidates, then the untouched tail.
    out.extend(slots.iter_mut().take(head_len).filter_map(Option::take));
    out.extend(slots.into_iter().flatten());
    out
}

// ---------------------------------------------------------------------------
// Cohere-compatible client
// ---------------------------------------------------------------------------

/// Client for a Cohere-style `POST {base_url}/rerank` endpoint.
pub struct CohereReranker {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [&'a str],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

impl CohereReranker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("OncallLens/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| OncallError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    /// Build from `[reranker]`, reading the key from its env var.
    pub fn from_config(config: &RerankerConfig) -> Result<Self> {
        let api_key = resolve_api_key(&config.api_key_env)?;
        Self::new(&config.base_url, api_key, &config.model, config.timeout())
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    fn name(&self) -> &str {
        "cohere"
    }

    async fn rerank(&self, query: &str, candidates: &[&str]) -> Result<Vec<RerankHit>> {
        let body = RerankRequest {
            model: &self.model,
            query,
            documents: candidates,
            top_n: candidates.len(),
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| OncallError::Rerank(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OncallError::Rerank(format!("HTTP {status}")));
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| OncallError::Rerank(format!("invalid response body: {e}")))?;
        Ok(parsed.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(ids: &[&str]) -> Vec<RetrievedDocument> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let mut d = RetrievedDocument::new(*id, format!("text {id}"), 1.0, "lexical");
                d.fused_score = 1.0 - i as f64 * 0.1;
                d
            })
            .collect()
    }

    fn ids(docs: &[RetrievedDocument]) -> Vec<&str> {
        docs.iter().map(|d| d.id.as_str()).collect()
    }

    struct Scripted(Result<Vec<RerankHit>>);

    #[async_trait]
    impl Reranker for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn rerank(&self, _q: &str, _c: &[&str]) -> Result<Vec<RerankHit>> {
            match &self.0 {
                Ok(hits) => Ok(hits.clone()),
                Err(e) => Err(OncallError::Rerank(e.to_string())),
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Reranker for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        async fn rerank(&self, _q: &str, _c: &[&str]) -> Result<Vec<RerankHit>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        }
    }

    fn hit(index: usize, score: f64) -> RerankHit {
        RerankHit { index, score }
    }

    #[tokio::test]
    async fn reorders_only_the_head() {
        let reranker = Scripted(Ok(vec![hit(2, 0.9), hit(0, 0.5)]));
        let out = apply_rerank(&reranker, "q", docs(&["a", "b", "c", "d"]), 3, Duration::from_secs(1)).await;
        assert!(out.fallback.is_none());
        assert_eq!(ids(&out.documents), vec!["c", "a", "b", "d"]);
        assert_eq!(out.documents[0].rerank_score, Some(0.9));
        assert_eq!(out.documents[2].rerank_score, None);
    }

    #[tokio::test]
    async fn failure_keeps_fused_order() {
        let original = docs(&["a", "b", "c"]);
        let reranker = Scripted(Err(OncallError::Rerank("503".into())));
        let out = apply_rerank(&reranker, "q", original.clone(), 10, Duration::from_secs(1)).await;
        assert_eq!(out.documents, original);
        assert!(out.fallback.is_some());
    }

    #[tokio::test]
    async fn out_of_range_index_is_a_failure() {
        let original = docs(&["a", "b"]);
        let reranker = Scripted(Ok(vec![hit(5, 0.9)]));
        let out = apply_rerank(&reranker, "q", original.clone(), 2, Duration::from_secs(1)).await;
        assert_eq!(out.documents, original);
        assert!(out.fallback.unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn timeout_keeps_fused_order() {
        let original = docs(&["a", "b"]);
        let out = apply_rerank(&Slow, "q", original.clone(), 2, Duration::from_millis(20)).await;
        assert_eq!(out.documents, original);
        assert!(out.fallback.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cohere_client_parses_results() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rerank"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    { "index": 1, "relevance_score": 0.98 },
                    { "index": 0, "relevance_score": 0.12 }
                ]
            })))
            .mount(&server)
            .await;

        let client = CohereReranker::new(server.uri(), "test-key", "rerank-v3.5", Duration::from_secs(5)).unwrap();
        let hits = client.rerank("disk full", &["first", "second"]).await.unwrap();
        assert_eq!(hits, vec![hit(1, 0.98), hit(0, 0.12)]);
    }

    #[tokio::test]
    async fn cohere_client_maps_http_errors() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CohereReranker::new(server.uri(), "k", "m", Duration::from_secs(5)).unwrap();
        let err = client.rerank("q", &["a"]).await.unwrap_err();
        assert!(matches!(err, OncallError::Rerank(_)));
        assert_eq!(err.kind(), oncall_shared::ErrorKind::Rerank);
    }
}
