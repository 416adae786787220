//! HTTP fetching with retry.

use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use concierge_shared::{ConciergeError, Result};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Attempts per URL, including the first.
const MAX_ATTEMPTS: usize = 3;

/// Extensions that are never HTML; skipped without a request.
const NON_HTML_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".ico", ".pdf", ".zip", ".gz", ".tar",
    ".mp3", ".mp4", ".avi", ".mov", ".css", ".js", ".woff", ".woff2", ".ttf", ".xml", ".rss",
];

/// A completed fetch: final status and body. Error statuses are data here,
/// not errors; only transport failures after retries become `Err`.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: StatusCode,
    pub body: String,
}

/// HTTP fetcher shared by all crawl workers.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConciergeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetcher sharing an existing client (the one the policy filter uses).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// GET a page, retrying timeouts, connect failures, 429 and 5xx with
    /// exponential backoff.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedBody> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if (status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error())
                        && attempt + 1 < MAX_ATTEMPTS
                    {
                        attempt += 1;
                        tracing::debug!(%url, %status, attempt, "retrying fetch");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }

                    let body = resp
                        .text()
                        .await
                        .map_err(|e| ConciergeError::Network(e.to_string()))?;
                    return Ok(FetchedBody { status, body });
                }
                Err(err) => {
                    if (err.is_timeout() || err.is_connect()) && attempt + 1 < MAX_ATTEMPTS {
                        attempt += 1;
                        tracing::debug!(%url, error = %err, attempt, "retrying fetch");
                        tokio::time::sleep(backoff(attempt)).await;
                        continue;
                    }
                    return Err(ConciergeError::Network(err.to_string()));
                }
            }
        }
    }
}

fn backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(250 * (1 << capped))
}

/// Whether a URL plausibly points at an HTML page, judged by extension.
pub fn looks_like_html(url: &Url) -> bool {
    let path = url.path().to_ascii_lowercase();
    !NON_HTML_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
