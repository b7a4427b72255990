//! Parent-window retrieval: match small chunks, return the whole document.

use std::sync::Arc;

use async_trait::async_trait;

use oncall_shared::Result;

use crate::kb::KnowledgeBase;
use crate::strategies::semantic::ChunkVectors;
use crate::types::{RetrievalQuery, RetrievalStrategy, RetrievedDocument};

pub struct ParentDocumentStrategy {
    kb: Arc<KnowledgeBase>,
    vectors: ChunkVectors,
}

impl ParentDocumentStrategy {
    pub const NAME: &'static str = "parent_document";

    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        let vectors = ChunkVectors::build(&kb);
        Self { kb, vectors }
    }
}

#[async_trait]
impl RetrievalStrategy for ParentDocumentStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    /// Hits keep the matched chunk id with `parent_id` set; fusion collapses
    /// several chunks of one parent into a single entry.
    async fn query(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedDocument>> {
        let chunks = self.kb.chunks();
        let admit = |i: usize| {
            self.kb
                .document(&chunks[i].parent_id)
                .is_some_and(|d| query.matches(&d.metadata))
        };

        let mut parents_seen = Vec::new();
        let mut hits = Vec::new();
        for (i, score) in self.vectors.search(&query.text, admit) {
            let chunk = &chunks[i];
            let Some(parent) = self.kb.document(&chunk.parent_id) else {
                continue;
            };
            if !parents_seen.contains(&parent.id) {
                if parents_seen.len() == query.top_k {
                    break;
                }
                parents_seen.push(parent.id.clone());
            }
            hits.push(
                RetrievedDocument::new(&chunk.id, &parent.text, score, Self::NAME)
                    .with_parent(&parent.id)
                    .with_metadata(parent.metadata.clone()),
            );
        }
        Ok(hits)
    }
}
