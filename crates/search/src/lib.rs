//! ScopeRAG retrieval core
//!
//! - [`store`]: vector-store client seam (Qdrant REST, scripted fake)
//! - [`router`]: scope selection with scope and legacy-name fallback, health
//! - [`retrieval`]: embedding, thresholding, deduplication, context assembly
//! - [`answer`]: streaming answer state machine

pub mod answer;
pub mod retrieval;
pub mod router;
pub mod store;

pub use answer::{AnswerRequest, AnswerStream, AnswerStreamer, StreamChunk, StreamState};
pub use retrieval::{Reference, RetrievalEngine, RetrievalResult, RetrievalSettings};
pub use router::{SearchOutcome, SearchStatus, VectorStoreRouter};
pub use store::{QdrantStore, RetrievalHit, VectorStore};

#[cfg(any(test, feature = "testing"))]
pub use store::ScriptedStore;
