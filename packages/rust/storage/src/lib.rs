//! libSQL storage layer for Concierge.
//!
//! The [`Storage`] struct wraps a local libSQL database holding page records,
//! chunks, persisted embeddings, and ingestion run history. The in-memory
//! vector index is rebuilt from the `vectors` table at startup via
//! [`Storage::load_all_vectors`].

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};

use concierge_shared::{Chunk, ConciergeError, PageRecord, PageState, Result, RunState};

/// Summary of one ingestion run, as stored in `ingest_runs`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunState,
    pub pages_discovered: u64,
    pub pages_indexed: u64,
    pub pages_failed: u64,
    pub error: Option<String>,
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConciergeError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        let storage = Self { db, conn };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ConciergeError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Document operations
    // -----------------------------------------------------------------------

    /// Insert or update the record for a URL.
    pub async fn upsert_document(&self, record: &PageRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO documents
                   (id, url, title, content_hash, fetched_at, status_code, chunk_count,
                    image_url, published_date, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(url) DO UPDATE SET
                   title = excluded.title,
                   content_hash = excluded.content_hash,
                   fetched_at = excluded.fetched_at,
                   status_code = excluded.status_code,
                   chunk_count = excluded.chunk_count,
                   image_url = excluded.image_url,
                   published_date = excluded.published_date,
                   state = excluded.state,
                   updated_at = excluded.updated_at",
                params![
                    record.id.as_str(),
                    record.url.as_str(),
                    record.title.as_deref(),
                    record.content_hash.as_str(),
                    record.fetched_at.to_rfc3339(),
                    record.status_code.map(i64::from),
                    record.chunk_count as i64,
                    record.image_url.as_deref(),
                    record.published_date.as_deref(),
                    record.state.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Look up a page record by normalized URL.
    pub async fn get_document_by_url(&self, url: &str) -> Result<Option<PageRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, url, title, content_hash, fetched_at, status_code, chunk_count,
                        image_url, published_date, state
                 FROM documents WHERE url = ?1",
                params![url],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_page_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ConciergeError::Storage(e.to_string())),
        }
    }

    /// Update only the indexing state of a document.
    pub async fn set_document_state(&self, url: &str, state: PageState) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE documents SET state = ?1, updated_at = ?2 WHERE url = ?3",
                params![state.as_str(), now.as_str(), url],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Backfill title / image / published date for an unchanged page.
    /// Only fields that are currently NULL are written.
    pub async fn backfill_document_metadata(
        &self,
        url: &str,
        title: Option<&str>,
        image_url: Option<&str>,
        published_date: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE documents SET
                   title = COALESCE(title, ?1),
                   image_url = COALESCE(image_url, ?2),
                   published_date = COALESCE(published_date, ?3),
                   fetched_at = ?4,
                   updated_at = ?4
                 WHERE url = ?5",
                params![title, image_url, published_date, now.as_str(), url],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// URLs whose records are in a non-terminal state (`pending` or
    /// `accepted`); they are re-enqueued at the start of the next run.
    pub async fn nonterminal_urls(&self) -> Result<Vec<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT url FROM documents WHERE state IN ('pending', 'accepted') ORDER BY url",
                params![],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        let mut urls = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            urls.push(
                row.get::<String>(0)
                    .map_err(|e| ConciergeError::Storage(e.to_string()))?,
            );
        }
        Ok(urls)
    }

    /// Number of stored documents.
    pub async fn count_documents(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM documents", params![])
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<u64>(0)
                .map_err(|e| ConciergeError::Storage(e.to_string())),
            _ => Ok(0),
        }
    }

    /// Resolve `(url, image_url, title)` for stored documents matching `urls`.
    /// URLs without a record or without an image are omitted.
    pub async fn get_images_for_urls(
        &self,
        urls: &[String],
    ) -> Result<Vec<(String, String, Option<String>)>> {
        let mut results = Vec::new();
        for url in urls {
            let mut rows = self
                .conn
                .query(
                    "SELECT url, image_url, title FROM documents
                     WHERE url = ?1 AND image_url IS NOT NULL",
                    params![url.as_str()],
                )
                .await
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            if let Ok(Some(row)) = rows.next().await {
                results.push((
                    row.get::<String>(0)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                    row.get::<String>(1)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                    row.get::<Option<String>>(2)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                ));
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Chunk operations
    // -----------------------------------------------------------------------

    /// Replace all chunks for a document: delete the old set, insert the new.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM chunks WHERE document_id = ?1",
                params![document_id],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        for chunk in chunks {
            self.conn
                .execute(
                    "INSERT INTO chunks (id, document_id, source_url, position, text)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        chunk.id,
                        document_id,
                        chunk.source_url.as_str(),
                        chunk.position as i64,
                        chunk.text.as_str(),
                    ],
                )
                .await
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    /// Chunk ids currently stored for a URL.
    pub async fn chunk_ids_for_url(&self, url: &str) -> Result<Vec<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id FROM chunks WHERE source_url = ?1 ORDER BY position",
                params![url],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            ids.push(
                row.get::<i64>(0)
                    .map_err(|e| ConciergeError::Storage(e.to_string()))?,
            );
        }
        Ok(ids)
    }

    /// Hydrate chunks by id. Order of the result matches the input ids;
    /// unknown ids are skipped.
    pub async fn get_chunks_by_ids(&self, ids: &[i64]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut rows = self
                .conn
                .query(
                    "SELECT id, source_url, position, text FROM chunks WHERE id = ?1",
                    params![id],
                )
                .await
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;

            if let Ok(Some(row)) = rows.next().await {
                chunks.push(Chunk {
                    id: row
                        .get::<i64>(0)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                    source_url: row
                        .get::<String>(1)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                    position: row
                        .get::<u32>(2)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                    text: row
                        .get::<String>(3)
                        .map_err(|e| ConciergeError::Storage(e.to_string()))?,
                });
            }
        }
        Ok(chunks)
    }

    // -----------------------------------------------------------------------
    // Vector operations
    // -----------------------------------------------------------------------

    /// Insert or replace the persisted embedding for a chunk.
    pub async fn upsert_vector(
        &self,
        chunk_id: i64,
        source_url: &str,
        position: u32,
        embedding: &[f32],
    ) -> Result<()> {
        let blob = encode_embedding(embedding);
        self.conn
            .execute(
                "INSERT INTO vectors (chunk_id, source_url, position, embedding)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                   source_url = excluded.source_url,
                   position = excluded.position,
                   embedding = excluded.embedding",
                params![chunk_id, source_url, position as i64, blob],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Drop all persisted embeddings for a URL.
    pub async fn delete_vectors_for_url(&self, url: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM vectors WHERE source_url = ?1", params![url])
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load every persisted embedding; used to rebuild the in-memory index.
    pub async fn load_all_vectors(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let mut rows = self
            .conn
            .query("SELECT chunk_id, embedding FROM vectors", params![])
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        let mut vectors = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let chunk_id = row
                .get::<i64>(0)
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            let blob = row
                .get::<Vec<u8>>(1)
                .map_err(|e| ConciergeError::Storage(e.to_string()))?;
            vectors.push((chunk_id, decode_embedding(&blob)?));
        }
        Ok(vectors)
    }

    // -----------------------------------------------------------------------
    // Ingestion run history
    // -----------------------------------------------------------------------

    /// Record the start of an ingestion run.
    pub async fn create_run(&self, run_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO ingest_runs (id, started_at, status) VALUES (?1, ?2, ?3)",
                params![run_id, now.as_str(), RunState::Running.as_str()],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Update progress counters for a running ingestion.
    pub async fn update_run_progress(
        &self,
        run_id: &str,
        pages_discovered: u64,
        pages_indexed: u64,
        pages_failed: u64,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingest_runs SET
                   pages_discovered = ?1, pages_indexed = ?2, pages_failed = ?3
                 WHERE id = ?4",
                params![
                    pages_discovered as i64,
                    pages_indexed as i64,
                    pages_failed as i64,
                    run_id,
                ],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished, with an optional error and stats payload.
    pub async fn finish_run(
        &self,
        run_id: &str,
        status: RunState,
        error: Option<&str>,
        stats_json: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE ingest_runs SET
                   finished_at = ?1, status = ?2, error = ?3, stats_json = ?4
                 WHERE id = ?5",
                params![now.as_str(), status.as_str(), error, stats_json, run_id],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recently started run, if any.
    pub async fn latest_run(&self) -> Result<Option<RunSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, status,
                        pages_discovered, pages_indexed, pages_failed, error
                 FROM ingest_runs ORDER BY started_at DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(|e| ConciergeError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run_summary(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ConciergeError::Storage(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping and blob codec
// ---------------------------------------------------------------------------

fn row_to_page_record(row: &libsql::Row) -> Result<PageRecord> {
    let fetched_at_raw = row
        .get::<String>(4)
        .map_err(|e| ConciergeError::Storage(e.to_string()))?;
    let fetched_at = DateTime::parse_from_rfc3339(&fetched_at_raw)
        .map_err(|e| ConciergeError::Storage(format!("bad fetched_at: {e}")))?
        .with_timezone(&Utc);

    let state_raw = row
        .get::<String>(9)
        .map_err(|e| ConciergeError::Storage(e.to_string()))?;

    Ok(PageRecord {
        id: row
            .get::<String>(0)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        url: row
            .get::<String>(1)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        title: row
            .get::<Option<String>>(2)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        content_hash: row
            .get::<String>(3)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        fetched_at,
        status_code: row
            .get::<Option<u32>>(5)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?
            .map(|c| c as u16),
        chunk_count: row
            .get::<u64>(6)
            .map_err(|e| ConciergeError::Storage(e.to_string()))? as usize,
        image_url: row
            .get::<Option<String>>(7)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        published_date: row
            .get::<Option<String>>(8)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        state: PageState::parse(&state_raw)?,
    })
}

fn row_to_run_summary(row: &libsql::Row) -> Result<RunSummary> {
    let parse_ts = |raw: &str| -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ConciergeError::Storage(format!("bad timestamp: {e}")))
    };

    let started_raw = row
        .get::<String>(1)
        .map_err(|e| ConciergeError::Storage(e.to_string()))?;
    let finished_raw = row
        .get::<Option<String>>(2)
        .map_err(|e| ConciergeError::Storage(e.to_string()))?;
    let status_raw = row
        .get::<String>(3)
        .map_err(|e| ConciergeError::Storage(e.to_string()))?;

    let status = match status_raw.as_str() {
        "idle" => RunState::Idle,
        "running" => RunState::Running,
        "completed" => RunState::Completed,
        "failed" => RunState::Failed,
        other => {
            return Err(ConciergeError::Storage(format!(
                "unknown run status '{other}'"
            )));
        }
    };

    Ok(RunSummary {
        id: row
            .get::<String>(0)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        started_at: parse_ts(&started_raw)?,
        finished_at: finished_raw.as_deref().map(parse_ts).transpose()?,
        status,
        pages_discovered: row
            .get::<u64>(4)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        pages_indexed: row
            .get::<u64>(5)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        pages_failed: row
            .get::<u64>(6)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
        error: row
            .get::<Option<String>>(7)
            .map_err(|e| ConciergeError::Storage(e.to_string()))?,
    })
}

/// Encode an embedding as little-endian f32 bytes.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob back into an embedding.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(ConciergeError::Storage(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
