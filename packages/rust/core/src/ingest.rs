//! Ingestion runs: triggering, progress recording, and status.
//!
//! One ingestion runs at a time. [`IngestService::run`] refuses a second
//! concurrent trigger, records progress into `ingest_runs` while the crawl
//! engine works, and finalizes the run row on completion or failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use concierge_crawler::{CrawlEngine, CrawlReport, Fetcher};
use concierge_index::{Embedder, VectorIndex};
use concierge_policy::PolicyFilter;
use concierge_shared::{ConciergeError, CrawlConfig, PolicyConfig, Result, RunState};
use concierge_storage::Storage;

/// How often run progress is flushed to storage.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of ingestion state for the status interface.
#[derive(Debug, Clone)]
pub struct IngestStatus {
    pub state: RunState,
    pub run_id: Option<String>,
    pub pages_discovered: u64,
    pub pages_indexed: u64,
    pub pages_failed: u64,
    pub elapsed: Option<Duration>,
    pub error: Option<String>,
}

/// Coordinates crawl runs over shared storage and index.
pub struct IngestService {
    crawl_config: CrawlConfig,
    policy_config: PolicyConfig,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    storage: Arc<Storage>,
    stop: Arc<AtomicBool>,
    running: AtomicBool,
}

impl IngestService {
    pub fn new(
        crawl_config: CrawlConfig,
        policy_config: PolicyConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<RwLock<VectorIndex>>,
        storage: Arc<Storage>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            crawl_config,
            policy_config,
            embedder,
            index,
            storage,
            stop,
            running: AtomicBool::new(false),
        }
    }

    /// Rebuild an in-memory index from persisted vectors.
    pub async fn rebuild_index(storage: &Storage) -> Result<VectorIndex> {
        let mut index = VectorIndex::new();
        for (chunk_id, vector) in storage.load_all_vectors().await? {
            if let Err(e) = index.upsert(chunk_id, vector) {
                warn!(chunk_id, error = %e, "skipping persisted vector");
            }
        }
        info!(vectors = index.len(), "vector index rebuilt");
        Ok(index)
    }

    /// Trigger an ingestion run. Errors immediately if one is already
    /// running. The stop flag is cleared at the start of each run.
    #[instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn run(&self, seeds: Vec<Url>) -> Result<CrawlReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConciergeError::validation("an ingestion is already running"));
        }

        let result = self.run_inner(seeds).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, seeds: Vec<Url>) -> Result<CrawlReport> {
        self.stop.store(false, Ordering::SeqCst);

        let run_id = Uuid::now_v7().to_string();
        self.storage.create_run(&run_id).await?;

        let client = reqwest::Client::builder()
            .user_agent(self.policy_config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ConciergeError::Network(format!("failed to build HTTP client: {e}")))?;

        let policy = Arc::new(PolicyFilter::new(
            &self.policy_config,
            &seeds,
            client.clone(),
        )?);

        let engine = CrawlEngine::new(
            self.crawl_config.clone(),
            policy,
            Fetcher::with_client(client),
            self.embedder.clone(),
            self.index.clone(),
            self.storage.clone(),
            self.stop.clone(),
        );

        // Flush live counters into the run row while the engine works.
        let stats = engine.stats();
        let progress_storage = self.storage.clone();
        let progress_run_id = run_id.clone();
        let progress = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
            loop {
                ticker.tick().await;
                let result = progress_storage
                    .update_run_progress(
                        &progress_run_id,
                        stats.pages_discovered.load(Ordering::Relaxed),
                        stats.pages_indexed.load(Ordering::Relaxed),
                        stats.pages_failed.load(Ordering::Relaxed),
                    )
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "failed to record run progress");
                }
            }
        });

        let outcome = engine.run(seeds).await;
        progress.abort();

        match outcome {
            Ok(report) => {
                self.storage
                    .update_run_progress(
                        &run_id,
                        report.pages_discovered,
                        report.pages_indexed,
                        report.pages_failed,
                    )
                    .await?;
                let stats_json = serde_json::json!({
                    "pages_fetched": report.pages_fetched,
                    "pages_skipped": report.pages_skipped,
                    "cap_reached": report.cap_reached,
                    "elapsed_s": report.duration.as_secs(),
                })
                .to_string();
                self.storage
                    .finish_run(&run_id, RunState::Completed, None, Some(&stats_json))
                    .await?;
                Ok(report)
            }
            Err(e) => {
                self.storage
                    .finish_run(&run_id, RunState::Failed, Some(&e.to_string()), None)
                    .await?;
                Err(e)
            }
        }
    }

    /// Status of the latest run, or idle if none exists.
    pub async fn status(&self) -> Result<IngestStatus> {
        Self::status_of(&self.storage).await
    }

    /// Status snapshot straight from storage, without a full service.
    pub async fn status_of(storage: &Storage) -> Result<IngestStatus> {
        let Some(run) = storage.latest_run().await? else {
            return Ok(IngestStatus {
                state: RunState::Idle,
                run_id: None,
                pages_discovered: 0,
                pages_indexed: 0,
                pages_failed: 0,
                elapsed: None,
                error: None,
            });
        };

        let elapsed = match run.finished_at {
            Some(finished) => (finished - run.started_at).to_std().ok(),
            None => (chrono::Utc::now() - run.started_at).to_std().ok(),
        };

        Ok(IngestStatus {
            state: run.status,
            run_id: Some(run.id),
            pages_discovered: run.pages_discovered,
            pages_indexed: run.pages_indexed,
            pages_failed: run.pages_failed,
            elapsed,
            error: run.error,
        })
    }

    /// Raise the cooperative stop flag for the current run.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct HashingEmbedder;

    #[async_trait]
    impl Embedder for HashingEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|text| {
                    let mut vector = vec![0.0f32; 16];
                    for word in text.split_whitespace() {
                        let mut hasher = DefaultHasher::new();
                        word.to_lowercase().hash(&mut hasher);
                        vector[(hasher.finish() % 16) as usize] += 1.0;
                    }
                    vector
                })
                .collect())
        }
    }

    async fn service(page_cap: usize) -> (Arc<IngestService>, Arc<Storage>) {
        let tmp = std::env::temp_dir().join(format!("concierge_ingest_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open db"));
        let index = Arc::new(RwLock::new(VectorIndex::new()));

        let service = Arc::new(IngestService::new(
            CrawlConfig {
                page_cap,
                concurrency: 2,
                host_fanout: 2,
                chunk_max_chars: 1000,
                chunk_overlap_chars: 120,
            },
            PolicyConfig {
                allow_patterns: vec![],
                deny_patterns: vec![],
                respect_robots_txt: true,
                crawl_delay_floor: Duration::from_millis(0),
                user_agent: "ConciergeBot/test".into(),
            },
            Arc::new(HashingEmbedder),
            index,
            storage.clone(),
            Arc::new(AtomicBool::new(false)),
        ));
        (service, storage)
    }

    async fn mount_site(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<main><p>A page about green chile stew.</p></main>"),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn run_records_completed_status() {
        let server = MockServer::start().await;
        mount_site(&server).await;

        let (service, _storage) = service(10).await;
        let seeds = vec![Url::parse(&format!("{}/", server.uri())).unwrap()];
        let report = service.run(seeds).await.unwrap();
        assert_eq!(report.pages_indexed, 1);

        let status = service.status().await.unwrap();
        assert_eq!(status.state, RunState::Completed);
        assert_eq!(status.pages_indexed, 1);
        assert!(status.elapsed.is_some());
    }

    #[tokio::test]
    async fn concurrent_runs_are_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<main><p>Slow page body.</p></main>")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let (service, _storage) = service(10).await;
        let seeds = vec![Url::parse(&format!("{}/", server.uri())).unwrap()];

        let background = {
            let service = service.clone();
            let seeds = seeds.clone();
            tokio::spawn(async move { service.run(seeds).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = service.run(seeds).await;
        assert!(matches!(
            second,
            Err(ConciergeError::Validation { .. })
        ));

        background.await.unwrap().unwrap();
        // After the first run finishes, a new one is accepted.
        assert!(service.status().await.unwrap().state == RunState::Completed);
    }

    #[tokio::test]
    async fn status_is_idle_with_no_history() {
        let (service, _storage) = service(10).await;
        let status = service.status().await.unwrap();
        assert_eq!(status.state, RunState::Idle);
        assert!(status.run_id.is_none());
    }

    #[tokio::test]
    async fn index_rebuild_restores_persisted_vectors() {
        let server = MockServer::start().await;
        mount_site(&server).await;

        let (service, storage) = service(10).await;
        let seeds = vec![Url::parse(&format!("{}/", server.uri())).unwrap()];
        service.run(seeds).await.unwrap();

        let rebuilt = IngestService::rebuild_index(&storage).await.unwrap();
        assert!(!rebuilt.is_empty());
    }
}
