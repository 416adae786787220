//! Crawl scheduling and page ingestion for Concierge.
//!
//! [`CrawlEngine`] runs a pool of workers over a shared [`Frontier`],
//! applying the admission policy, fetching politely per host, and indexing
//! changed pages through the extractor, embedder, and vector index.

pub mod engine;
pub mod fetch;
pub mod frontier;

pub use engine::{CrawlEngine, CrawlReport, RunStats};
pub use fetch::{FetchedBody, Fetcher, looks_like_html};
pub use frontier::{Dispatch, Frontier, normalize_url};
