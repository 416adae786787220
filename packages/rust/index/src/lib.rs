//! Embeddings and vector search for Concierge.
//!
//! [`Embedder`] is the pluggable text-to-vector capability, with
//! [`OpenAiEmbedder`] as the production implementation. [`VectorIndex`] is
//! the in-memory cosine index the retriever searches.

pub mod embedder;
pub mod vector;

pub use embedder::{Embedder, OpenAiEmbedder};
pub use vector::{SearchHit, VectorIndex};
