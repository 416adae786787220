//! Core services for Concierge: ingestion runs, ranked retrieval, and
//! grounded answer streaming.

pub mod generate;
pub mod ingest;
pub mod retriever;
pub mod streamer;

pub use generate::{Generator, OpenAiGenerator};
pub use ingest::{IngestService, IngestStatus};
pub use retriever::{RetrievedChunk, Retriever};
pub use streamer::{AnswerStreamer, Fragment, SourceImage};
