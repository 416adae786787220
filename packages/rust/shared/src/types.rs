//! Core domain types for the Concierge ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ConciergeError, Result};

// ---------------------------------------------------------------------------
// PageState
// ---------------------------------------------------------------------------

/// Indexing state of a [`PageRecord`].
///
/// `Pending` is set before stale chunks are removed and cleared only after the
/// replacement set is fully inserted, so a crash mid-re-ingestion leaves a
/// marker that the next run retries. `Accepted` means the page was fetched and
/// extracted but the index was unavailable; it is also retried on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// Re-ingestion in progress: stale chunks may be removed, new ones not yet in.
    Pending,
    /// All chunks embedded and indexed.
    Indexed,
    /// Some chunks failed embedding; the rest are indexed.
    PartiallyIndexed,
    /// Fetched and extracted, but indexing could not run.
    Accepted,
}

impl PageState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Indexed => "indexed",
            Self::PartiallyIndexed => "partial",
            Self::Accepted => "accepted",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "indexed" => Ok(Self::Indexed),
            "partial" => Ok(Self::PartiallyIndexed),
            "accepted" => Ok(Self::Accepted),
            other => Err(ConciergeError::validation(format!(
                "unknown page state '{other}'"
            ))),
        }
    }

    /// Terminal states are not retried by later runs.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Indexed | Self::PartiallyIndexed)
    }
}

// ---------------------------------------------------------------------------
// PageRecord
// ---------------------------------------------------------------------------

/// One record per successfully fetched and accepted URL, stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Unique record identifier (UUID v7).
    pub id: String,
    /// Normalized page URL, unique per store.
    pub url: String,
    /// Page title (from `<title>` or first `<h1>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// SHA-256 hash of the extracted text.
    pub content_hash: String,
    /// When the page was last fetched.
    pub fetched_at: DateTime<Utc>,
    /// HTTP status code from the final fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Number of chunks produced by the last successful extraction.
    pub chunk_count: usize,
    /// Representative image URL (og:image or first in-content image).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Publication date advertised by the page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    /// Indexing state.
    pub state: PageState,
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// A contiguous span of extracted text from one page; the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable identifier derived from the source URL and position.
    pub id: i64,
    /// URL of the page this chunk came from.
    pub source_url: String,
    /// Zero-based position within the page's chunk sequence.
    pub position: u32,
    /// The chunk text.
    pub text: String,
}

/// Derive the stable chunk identifier for a (url, position) pair.
///
/// First 8 bytes of `sha256("{url}#{position}")`, shifted to stay
/// non-negative so the id survives i64 database columns and ID-mapped
/// vector stores.
pub fn chunk_id(url: &str, position: u32) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"#");
    hasher.update(position.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 1) as i64
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

/// Lifecycle of an ingestion run, as reported by the status interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}
