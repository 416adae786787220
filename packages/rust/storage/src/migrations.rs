//! SQL migration definitions for the Concierge database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: documents, chunks, vectors, ingest_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per accepted page
CREATE TABLE IF NOT EXISTS documents (
    id             TEXT PRIMARY KEY,
    url            TEXT NOT NULL UNIQUE,
    title          TEXT,
    content_hash   TEXT NOT NULL,
    fetched_at     TEXT NOT NULL,
    status_code    INTEGER,
    chunk_count    INTEGER NOT NULL DEFAULT 0,
    image_url      TEXT,
    published_date TEXT,
    state          TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(state);
CREATE INDEX IF NOT EXISTS idx_documents_content_hash ON documents(content_hash);

-- Retrieval units; id is derived from (url, position) and stays stable
CREATE TABLE IF NOT EXISTS chunks (
    id          INTEGER PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    source_url  TEXT NOT NULL,
    position    INTEGER NOT NULL,
    text        TEXT NOT NULL,
    UNIQUE(document_id, position)
);

CREATE INDEX IF NOT EXISTS idx_chunks_source_url ON chunks(source_url);

-- Persisted embeddings; f32 little-endian blobs
CREATE TABLE IF NOT EXISTS vectors (
    chunk_id   INTEGER PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    source_url TEXT NOT NULL,
    position   INTEGER NOT NULL,
    embedding  BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_vectors_source_url ON vectors(source_url);

-- Ingestion run history
CREATE TABLE IF NOT EXISTS ingest_runs (
    id               TEXT PRIMARY KEY,
    started_at       TEXT NOT NULL,
    finished_at      TEXT,
    status           TEXT NOT NULL,
    pages_discovered INTEGER NOT NULL DEFAULT 0,
    pages_indexed    INTEGER NOT NULL DEFAULT 0,
    pages_failed     INTEGER NOT NULL DEFAULT 0,
    stats_json       TEXT,
    error            TEXT
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
