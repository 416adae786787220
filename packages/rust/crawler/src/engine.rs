//! Concurrent crawl and ingestion engine.
//!
//! Workers pull URLs from the shared [`Frontier`], run them through the
//! policy filter, fetch and extract them, and index changed pages. Page
//! records move through a small state machine: `pending` while chunks are
//! being replaced, then `indexed`, `partial`, or `accepted` depending on how
//! embedding went. Non-terminal records are re-enqueued by the next run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;
use uuid::Uuid;

use concierge_extract::{chunk_text, content_hash, extract_page};
use concierge_index::{Embedder, VectorIndex};
use concierge_policy::PolicyFilter;
use concierge_shared::{Chunk, CrawlConfig, PageRecord, PageState, Result, chunk_id};
use concierge_storage::Storage;

use crate::fetch::{Fetcher, looks_like_html};
use crate::frontier::{Dispatch, Frontier, normalize_url};

/// Log a heartbeat every this many fetched pages.
const HEARTBEAT_EVERY: u64 = 25;

/// Upper bound on the random jitter added to each per-host delay.
const JITTER_MS: u64 = 250;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Live counters shared between the engine and its observers.
#[derive(Debug, Default)]
pub struct RunStats {
    pub pages_discovered: AtomicU64,
    pub pages_fetched: AtomicU64,
    pub pages_indexed: AtomicU64,
    pub pages_failed: AtomicU64,
    pub pages_skipped: AtomicU64,
}

impl RunStats {
    /// Zero all counters. Observers keep their handle across runs.
    fn reset(&self) {
        self.pages_discovered.store(0, Ordering::Relaxed);
        self.pages_fetched.store(0, Ordering::Relaxed);
        self.pages_indexed.store(0, Ordering::Relaxed);
        self.pages_failed.store(0, Ordering::Relaxed);
        self.pages_skipped.store(0, Ordering::Relaxed);
    }
}

/// Final report of one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub pages_discovered: u64,
    pub pages_fetched: u64,
    pub pages_indexed: u64,
    pub pages_failed: u64,
    pub pages_skipped: u64,
    pub cap_reached: bool,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Crawl engine wiring the frontier, policy, fetcher, extractor, embedder,
/// vector index, and storage together.
pub struct CrawlEngine {
    config: CrawlConfig,
    policy: Arc<PolicyFilter>,
    fetcher: Fetcher,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    storage: Arc<Storage>,
    stop: Arc<AtomicBool>,
    stats: Arc<RunStats>,
}

impl CrawlEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CrawlConfig,
        policy: Arc<PolicyFilter>,
        fetcher: Fetcher,
        embedder: Arc<dyn Embedder>,
        index: Arc<RwLock<VectorIndex>>,
        storage: Arc<Storage>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            policy,
            fetcher,
            embedder,
            index,
            storage,
            stop,
            stats: Arc::new(RunStats::default()),
        }
    }

    /// Live counters for progress reporting.
    pub fn stats(&self) -> Arc<RunStats> {
        self.stats.clone()
    }

    /// Crawl from `seeds` until the frontier drains, the page cap is hit, or
    /// the stop flag is raised. Hitting the cap is a normal completion.
    #[instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn run(&self, seeds: Vec<Url>) -> Result<CrawlReport> {
        let started = Instant::now();
        self.stats.reset();

        let mut frontier = Frontier::new(
            self.config.page_cap,
            self.config.host_fanout,
            self.policy.delay_floor(),
        );
        for seed in seeds {
            frontier.enqueue(seed);
        }

        // Interrupted pages from earlier runs get another chance.
        for url in self.storage.nonterminal_urls().await? {
            if let Ok(parsed) = Url::parse(&url) {
                frontier.enqueue(parsed);
            }
        }

        let discovered_seeds = frontier.discovered() as u64;
        self.stats
            .pages_discovered
            .store(discovered_seeds, Ordering::Relaxed);

        info!(
            page_cap = self.config.page_cap,
            concurrency = self.config.concurrency,
            host_fanout = self.config.host_fanout,
            seeds = discovered_seeds,
            "starting crawl"
        );

        let frontier = Arc::new(Mutex::new(frontier));
        let mut workers = Vec::with_capacity(self.config.concurrency.max(1));
        for worker_id in 0..self.config.concurrency.max(1) {
            let ctx = WorkerContext {
                config: self.config.clone(),
                policy: self.policy.clone(),
                fetcher: self.fetcher.clone(),
                embedder: self.embedder.clone(),
                index: self.index.clone(),
                storage: self.storage.clone(),
                stop: self.stop.clone(),
                stats: self.stats.clone(),
                frontier: frontier.clone(),
            };
            workers.push(tokio::spawn(async move {
                ctx.work_loop(worker_id).await;
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "crawl worker panicked");
            }
        }

        let cap_reached = frontier.lock().await.cap_reached();
        let report = CrawlReport {
            pages_discovered: self.stats.pages_discovered.load(Ordering::Relaxed),
            pages_fetched: self.stats.pages_fetched.load(Ordering::Relaxed),
            pages_indexed: self.stats.pages_indexed.load(Ordering::Relaxed),
            pages_failed: self.stats.pages_failed.load(Ordering::Relaxed),
            pages_skipped: self.stats.pages_skipped.load(Ordering::Relaxed),
            cap_reached,
            duration: started.elapsed(),
        };

        info!(
            fetched = report.pages_fetched,
            indexed = report.pages_indexed,
            failed = report.pages_failed,
            skipped = report.pages_skipped,
            cap_reached = report.cap_reached,
            elapsed_s = report.duration.as_secs(),
            "crawl finished"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct WorkerContext {
    config: CrawlConfig,
    policy: Arc<PolicyFilter>,
    fetcher: Fetcher,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    storage: Arc<Storage>,
    stop: Arc<AtomicBool>,
    stats: Arc<RunStats>,
    frontier: Arc<Mutex<Frontier>>,
}

impl WorkerContext {
    async fn work_loop(&self, worker_id: usize) {
        loop {
            let dispatch = {
                let mut frontier = self.frontier.lock().await;
                frontier.next(Instant::now())
            };

            let url = match dispatch {
                Dispatch::Exhausted => break,
                Dispatch::RetryAt(at) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await;
                    continue;
                }
                Dispatch::Entry(url) => url,
            };

            // Stop is cooperative: claimed but not yet fetched URLs are put
            // back as unconsumed cap and the worker exits.
            if self.stop.load(Ordering::Relaxed) {
                self.frontier.lock().await.release(&url);
                debug!(worker_id, "stop requested, worker exiting");
                break;
            }

            if !looks_like_html(&url) {
                self.frontier.lock().await.release(&url);
                self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let verdict = self.policy.evaluate(&url).await;
            if !verdict.is_allowed() {
                debug!(%url, ?verdict, "rejected by policy");
                self.frontier.lock().await.release(&url);
                self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            // Pacing starts when the fetch is dispatched, so two fetches to
            // the same host are never closer together than its delay.
            let delay = self.policy.crawl_delay(&url).await + jitter();
            self.frontier.lock().await.pace(&url, delay, Instant::now());

            if let Err(e) = self.process(&url).await {
                warn!(%url, error = %e, "page processing failed");
                self.stats.pages_failed.fetch_add(1, Ordering::Relaxed);
            }
            self.frontier.lock().await.complete(&url);
        }
    }

    /// Fetch, extract, and (when changed) re-index one URL.
    async fn process(&self, url: &Url) -> Result<()> {
        let fetched = self.fetcher.fetch(url).await?;
        let fetched_count = self.stats.pages_fetched.fetch_add(1, Ordering::Relaxed) + 1;
        if fetched_count % HEARTBEAT_EVERY == 0 {
            info!(
                fetched = fetched_count,
                indexed = self.stats.pages_indexed.load(Ordering::Relaxed),
                "crawl heartbeat"
            );
        }

        if !fetched.status.is_success() {
            debug!(%url, status = %fetched.status, "non-success response");
            self.stats.pages_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let page = extract_page(&fetched.body, url);

        // Discovered links go through the frontier's dedup; the policy is
        // applied when they are claimed.
        {
            let mut frontier = self.frontier.lock().await;
            for link in &page.links {
                frontier.enqueue(link.clone());
            }
            self.stats
                .pages_discovered
                .store(frontier.discovered() as u64, Ordering::Relaxed);
        }

        if page.text.is_empty() {
            debug!(%url, "no readable content");
            self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let normalized = normalize_url(url);
        let hash = content_hash(&page.text);

        let existing = self.storage.get_document_by_url(&normalized).await?;
        if let Some(existing) = &existing {
            if existing.content_hash == hash && existing.state.is_terminal() {
                // Unchanged page: keep its chunks, backfill missing metadata.
                self.storage
                    .backfill_document_metadata(
                        &normalized,
                        page.title.as_deref(),
                        page.image_url.as_deref(),
                        page.published_date.as_deref(),
                    )
                    .await?;
                self.stats.pages_skipped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        let chunks: Vec<Chunk> = chunk_text(
            &page.text,
            self.config.chunk_max_chars,
            self.config.chunk_overlap_chars,
        )
        .into_iter()
        .enumerate()
        .map(|(position, text)| Chunk {
            id: chunk_id(&normalized, position as u32),
            source_url: normalized.clone(),
            position: position as u32,
            text,
        })
        .collect();

        let record = PageRecord {
            id: existing
                .as_ref()
                .map(|e| e.id.clone())
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            url: normalized.clone(),
            title: page.title.clone(),
            content_hash: hash,
            fetched_at: chrono::Utc::now(),
            status_code: Some(fetched.status.as_u16()),
            chunk_count: chunks.len(),
            image_url: page.image_url.clone(),
            published_date: page.published_date.clone(),
            state: PageState::Pending,
        };

        // Pending marks the re-index window: if this worker dies here, the
        // next run re-enqueues the URL.
        self.storage.upsert_document(&record).await?;

        let stale_ids = self.storage.chunk_ids_for_url(&normalized).await?;
        self.storage.replace_chunks(&record.id, &chunks).await?;

        let (vectors, failed_chunks) = self.embed_chunks(&chunks).await;

        if vectors.is_empty() && !chunks.is_empty() {
            // Index unavailable: content is stored, indexing is retried next run.
            // The old chunk rows are already gone, so their vectors must not
            // keep answering queries against the replaced text.
            warn!(%url, "embedding unavailable, page accepted but not indexed");
            self.index.write().await.remove_many(&stale_ids);
            self.storage
                .set_document_state(&normalized, PageState::Accepted)
                .await?;
            self.stats.pages_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // One write guard covers removal and insertion, so a concurrent
        // search never sees a half-replaced page.
        {
            let mut index = self.index.write().await;
            index.remove_many(&stale_ids);
            for (chunk, vector) in &vectors {
                index.upsert(chunk.id, vector.clone())?;
            }
        }

        self.storage.delete_vectors_for_url(&normalized).await?;
        for (chunk, vector) in &vectors {
            self.storage
                .upsert_vector(chunk.id, &normalized, chunk.position, vector)
                .await?;
        }

        let final_state = if failed_chunks == 0 {
            PageState::Indexed
        } else {
            PageState::PartiallyIndexed
        };
        self.storage
            .set_document_state(&normalized, final_state)
            .await?;
        self.stats.pages_indexed.fetch_add(1, Ordering::Relaxed);
        debug!(%url, chunks = chunks.len(), failed_chunks, "page indexed");
        Ok(())
    }

    /// Embed a page's chunks: one batch call first, then per-chunk isolation
    /// if the batch fails, so one bad chunk cannot sink the whole page.
    async fn embed_chunks<'a>(&self, chunks: &'a [Chunk]) -> (Vec<(&'a Chunk, Vec<f32>)>, usize) {
        if chunks.is_empty() {
            return (Vec::new(), 0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        match self.embedder.embed(&texts).await {
            Ok(vectors) => (chunks.iter().zip(vectors).collect(), 0),
            Err(batch_err) => {
                debug!(error = %batch_err, "batch embedding failed, isolating per chunk");
                let mut embedded = Vec::new();
                let mut failed = 0usize;
                for chunk in chunks {
                    match self.embedder.embed(std::slice::from_ref(&chunk.text)).await {
                        Ok(mut vectors) if !vectors.is_empty() => {
                            embedded.push((chunk, vectors.remove(0)));
                        }
                        Ok(_) => failed += 1,
                        Err(e) => {
                            debug!(chunk_id = chunk.id, error = %e, "chunk embedding failed");
                            failed += 1;
                        }
                    }
                }
                (embedded, failed)
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MS))
}
