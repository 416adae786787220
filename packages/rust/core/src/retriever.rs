//! Ranked retrieval over the vector index.
//!
//! The retriever embeds the query, searches the in-memory index, hydrates
//! chunk text and document metadata from storage, and applies a recency
//! boost from the page's published date. Retrieval never errors: any
//! failure along the way degrades to an empty result so answering can say
//! "I don't know" instead of crashing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use concierge_index::{Embedder, VectorIndex};
use concierge_shared::Chunk;
use concierge_storage::Storage;

/// Extra candidates pulled from the index before the recency re-rank.
const CANDIDATE_FACTOR: usize = 4;

/// One retrieved chunk with its final score and document metadata.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Cosine similarity plus recency boost.
    pub score: f32,
    pub title: Option<String>,
    pub published_date: Option<String>,
}

/// Query-time retrieval service.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    storage: Arc<Storage>,
    top_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<RwLock<VectorIndex>>,
        storage: Arc<Storage>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            index,
            storage,
            top_k,
        }
    }

    /// Top chunks for a query, best first. Empty on any failure.
    pub async fn retrieve(&self, query: &str) -> Vec<RetrievedChunk> {
        let query = query.trim();
        if query.is_empty() || self.top_k == 0 {
            return Vec::new();
        }

        let query_vector = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "query embedding failed, returning no results");
                return Vec::new();
            }
        };

        let hits = {
            let index = self.index.read().await;
            index.search(&query_vector, self.top_k * CANDIDATE_FACTOR)
        };
        if hits.is_empty() {
            return Vec::new();
        }

        let ids: Vec<i64> = hits.iter().map(|h| h.chunk_id).collect();
        let chunks = match self.storage.get_chunks_by_ids(&ids).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "chunk hydration failed, returning no results");
                return Vec::new();
            }
        };

        let score_by_id: HashMap<i64, f32> = hits.iter().map(|h| (h.chunk_id, h.score)).collect();
        let mut metadata: HashMap<String, (Option<String>, Option<String>)> = HashMap::new();
        let now = Utc::now();

        let mut results: Vec<RetrievedChunk> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let Some(&similarity) = score_by_id.get(&chunk.id) else {
                continue;
            };

            let (title, published_date) = match metadata.get(&chunk.source_url) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self
                        .storage
                        .get_document_by_url(&chunk.source_url)
                        .await
                        .ok()
                        .flatten()
                        .map(|d| (d.title, d.published_date))
                        .unwrap_or((None, None));
                    metadata.insert(chunk.source_url.clone(), fetched.clone());
                    fetched
                }
            };

            let score = similarity + recency_boost(published_date.as_deref(), now);
            results.push(RetrievedChunk {
                chunk,
                score,
                title,
                published_date,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.position.cmp(&b.chunk.position))
                .then(a.chunk.source_url.cmp(&b.chunk.source_url))
        });
        results.truncate(self.top_k);
        debug!(query, results = results.len(), "retrieval complete");
        results
    }
}

/// Additive boost for recently published pages.
fn recency_boost(published_date: Option<&str>, now: DateTime<Utc>) -> f32 {
    let Some(raw) = published_date else {
        return 0.0;
    };
    let Some(published) = parse_date(raw) else {
        return 0.0;
    };

    let age_days = (now - published).num_days();
    if age_days < 0 {
        return 0.0;
    }
    match age_days {
        0..=180 => 0.15,
        181..=365 => 0.10,
        366..=730 => 0.05,
        _ => 0.0,
    }
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}
