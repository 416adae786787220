//! In-memory vector index.
//!
//! Brute-force cosine similarity over L2-normalized vectors. The index holds
//! no lock of its own: callers that share it across tasks wrap it in a
//! `tokio::sync::RwLock` and perform remove-then-upsert sequences for one
//! page under a single write guard.

use std::collections::HashMap;

use concierge_shared::{ConciergeError, Result};

/// One search hit: chunk id and cosine similarity in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub score: f32,
}

/// Brute-force cosine index keyed by chunk id.
#[derive(Debug, Default)]
pub struct VectorIndex {
    /// Dimensionality, fixed by the first inserted vector.
    dimension: Option<usize>,
    ids: Vec<i64>,
    /// Normalized vectors, parallel to `ids`.
    vectors: Vec<Vec<f32>>,
    slot_by_id: HashMap<i64, usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Dimensionality of stored vectors, `None` while empty.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Insert or replace the vector for `chunk_id`. The vector is normalized
    /// on the way in. Fails on a dimension mismatch or a zero vector.
    pub fn upsert(&mut self, chunk_id: i64, vector: Vec<f32>) -> Result<()> {
        if let Some(dim) = self.dimension {
            if vector.len() != dim {
                return Err(ConciergeError::Index(format!(
                    "dimension mismatch: index has {dim}, vector has {}",
                    vector.len()
                )));
            }
        }

        let normalized = normalize(vector)?;
        self.dimension.get_or_insert(normalized.len());

        match self.slot_by_id.get(&chunk_id) {
            Some(&slot) => self.vectors[slot] = normalized,
            None => {
                self.slot_by_id.insert(chunk_id, self.ids.len());
                self.ids.push(chunk_id);
                self.vectors.push(normalized);
            }
        }
        Ok(())
    }

    /// Remove `chunk_id` from the index. Returns whether it was present.
    pub fn remove(&mut self, chunk_id: i64) -> bool {
        let Some(slot) = self.slot_by_id.remove(&chunk_id) else {
            return false;
        };

        self.ids.swap_remove(slot);
        self.vectors.swap_remove(slot);
        if slot < self.ids.len() {
            self.slot_by_id.insert(self.ids[slot], slot);
        }
        if self.ids.is_empty() {
            self.dimension = None;
        }
        true
    }

    /// Remove a batch of chunk ids. Missing ids are ignored.
    pub fn remove_many(&mut self, chunk_ids: &[i64]) {
        for &id in chunk_ids {
            self.remove(id);
        }
    }

    /// Top-`k` most similar entries to `query`, best first. Ties break by
    /// ascending chunk id so results are deterministic. An empty index, a
    /// zero query, or a dimension mismatch yields no hits.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if k == 0 || self.ids.is_empty() || Some(query.len()) != self.dimension {
            return Vec::new();
        }
        let Ok(query) = normalize(query.to_vec()) else {
            return Vec::new();
        };

        let mut hits: Vec<SearchHit> = self
            .ids
            .iter()
            .zip(&self.vectors)
            .map(|(&chunk_id, vector)| SearchHit {
                chunk_id,
                score: dot(&query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        hits
    }
}

fn normalize(mut vector: Vec<f32>) -> Result<Vec<f32>> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(ConciergeError::Index("cannot normalize zero vector".into()));
    }
    for v in &mut vector {
        *v /= norm;
    }
    Ok(vector)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
