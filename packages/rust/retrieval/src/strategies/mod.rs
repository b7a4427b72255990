//! Built-in retrieval strategies.

mod lexical;
mod multi_query;
mod parent;
mod semantic;

pub use lexical::LexicalStrategy;
pub use multi_query::MultiQueryStrategy;
pub use parent::ParentDocumentStrategy;
pub use semantic::SemanticStrategy;
