//! Multi-strategy document retrieval for Oncall Lens.
//!
//! Strategies ([`RetrievalStrategy`]) each return their own ranked list;
//! [`fusion`] combines them into one deterministic ranking; an optional
//! [`Reranker`] reorders the head. [`RetrievalEngine`] ties the steps
//! together with per-strategy timeouts and graceful degradation.

mod engine;
pub mod fusion;
mod kb;
pub mod rerank;
pub mod strategies;
mod types;

pub use engine::{EngineOptions, RetrievalEngine, RetrievalOutcome};
pub use fusion::{FusionWeights, fuse};
pub use kb::{Chunk, ChunkingOptions, KbDocument, KbStats, KnowledgeBase, chunk_text, tokenize};
pub use rerank::{CohereReranker, RerankHit, Reranker};
pub use types::{
    Metadata, QueryExpander, RetrievalQuery, RetrievalStrategy, RetrievedDocument,
    StrategyResults,
};
