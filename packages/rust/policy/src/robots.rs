//! robots.txt fetching, parsing, and per-origin caching.
//!
//! Verdicts are cached per origin for [`ROBOTS_TTL`]. A missing robots.txt
//! (HTTP 404) means no restrictions; a transport failure or server error
//! means the origin is treated as fully disallowed until the cache entry
//! expires. Crawling without knowing the rules is not an option.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

/// How long a cached robots.txt verdict stays valid.
pub const ROBOTS_TTL: Duration = Duration::from_secs(30 * 60);

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Path rules for one user-agent group.
#[derive(Debug, Clone, Default)]
struct AgentRules {
    disallow: Vec<String>,
    allow: Vec<String>,
    crawl_delay: Option<f64>,
}

/// Parsed robots.txt content.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    /// Groups keyed by lowercased user-agent token.
    agents: HashMap<String, AgentRules>,
    /// Rules for `User-agent: *`.
    wildcard: AgentRules,
}

impl RobotsRules {
    /// Parse robots.txt text. Unknown directives are ignored.
    pub fn parse(content: &str) -> Self {
        let mut rules = Self::default();
        let mut group_agents: Vec<String> = Vec::new();
        let mut group = AgentRules::default();
        let mut in_group_body = false;

        let mut flush =
            |agents: &mut Vec<String>, group: &mut AgentRules, rules: &mut RobotsRules| {
                for agent in agents.drain(..) {
                    if agent == "*" {
                        rules.wildcard = group.clone();
                    } else {
                        rules.agents.insert(agent, group.clone());
                    }
                }
                *group = AgentRules::default();
            };

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((directive, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match directive.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if in_group_body {
                        flush(&mut group_agents, &mut group, &mut rules);
                        in_group_body = false;
                    }
                    group_agents.push(value.to_ascii_lowercase());
                }
                "disallow" => {
                    in_group_body = true;
                    if !value.is_empty() {
                        group.disallow.push(value.to_string());
                    }
                }
                "allow" => {
                    in_group_body = true;
                    if !value.is_empty() {
                        group.allow.push(value.to_string());
                    }
                }
                "crawl-delay" => {
                    in_group_body = true;
                    if let Ok(delay) = value.parse::<f64>() {
                        if delay.is_finite() && delay >= 0.0 {
                            group.crawl_delay = Some(delay);
                        }
                    }
                }
                _ => {}
            }
        }
        flush(&mut group_agents, &mut group, &mut rules);

        rules
    }

    fn rules_for(&self, user_agent: &str) -> &AgentRules {
        let agent = user_agent.to_ascii_lowercase();
        self.agents
            .iter()
            .find(|(token, _)| agent.contains(token.as_str()))
            .map(|(_, r)| r)
            .unwrap_or(&self.wildcard)
    }

    /// Whether `path` may be fetched by `user_agent`. Allow rules override
    /// disallow rules; both match by path prefix.
    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let rules = self.rules_for(user_agent);

        if rules.allow.iter().any(|prefix| path.starts_with(prefix)) {
            return true;
        }
        !rules
            .disallow
            .iter()
            .any(|prefix| path.starts_with(prefix))
    }

    /// Crawl-delay requested for `user_agent`, if any.
    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.rules_for(user_agent)
            .crawl_delay
            .or(self.wildcard.crawl_delay)
            .map(Duration::from_secs_f64)
    }
}

// ---------------------------------------------------------------------------
// Per-origin cache
// ---------------------------------------------------------------------------

/// Cached verdict for one origin.
#[derive(Debug, Clone)]
enum RobotsState {
    /// No robots.txt served (404): everything is allowed.
    Unrestricted,
    /// Parsed rules.
    Rules(RobotsRules),
    /// Fetch failed or the server errored: everything is disallowed.
    Unavailable,
}

#[derive(Debug)]
struct CacheEntry {
    fetched_at: Instant,
    state: RobotsState,
}

/// Per-origin robots.txt cache backed by a shared HTTP client.
#[derive(Debug)]
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            ttl: ROBOTS_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether `url` may be fetched under the origin's robots rules.
    pub async fn is_allowed(&self, url: &Url) -> bool {
        let path = url.path().to_string();
        match self.lookup(url).await {
            RobotsState::Unrestricted => true,
            RobotsState::Rules(rules) => rules.is_allowed(&self.user_agent, &path),
            RobotsState::Unavailable => false,
        }
    }

    /// Crawl-delay requested by the origin's robots.txt, if any.
    pub async fn crawl_delay(&self, url: &Url) -> Option<Duration> {
        match self.lookup(url).await {
            RobotsState::Rules(rules) => rules.crawl_delay(&self.user_agent),
            _ => None,
        }
    }

    async fn lookup(&self, url: &Url) -> RobotsState {
        let origin = url.origin().ascii_serialization();

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&origin) {
            if entry.fetched_at.elapsed() < self.ttl {
                return entry.state.clone();
            }
        }

        let state = self.fetch(&origin).await;
        entries.insert(
            origin,
            CacheEntry {
                fetched_at: Instant::now(),
                state: state.clone(),
            },
        );
        state
    }

    async fn fetch(&self, origin: &str) -> RobotsState {
        let robots_url = format!("{origin}/robots.txt");

        let response = match self
            .client
            .get(&robots_url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%robots_url, error = %e, "robots.txt unreachable, disallowing origin");
                return RobotsState::Unavailable;
            }
        };

        match response.status() {
            s if s.is_success() => match response.text().await {
                Ok(body) => RobotsState::Rules(RobotsRules::parse(&body)),
                Err(e) => {
                    tracing::warn!(%robots_url, error = %e, "robots.txt body read failed");
                    RobotsState::Unavailable
                }
            },
            reqwest::StatusCode::NOT_FOUND => RobotsState::Unrestricted,
            s => {
                tracing::warn!(%robots_url, status = %s, "robots.txt fetch errored, disallowing origin");
                RobotsState::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_basic_rules() {
        let rules = RobotsRules::parse(
            "User-agent: *\n\
             Disallow: /private/\n\
             Allow: /private/shared/\n\
             Crawl-delay: 3\n",
        );

        assert!(rules.is_allowed("ConciergeBot/0.1.0", "/blog/post"));
        assert!(!rules.is_allowed("ConciergeBot/0.1.0", "/private/page"));
        assert!(rules.is_allowed("ConciergeBot/0.1.0", "/private/shared/page"));
        assert_eq!(
            rules.crawl_delay("ConciergeBot/0.1.0"),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn agent_specific_group_wins() {
        let rules = RobotsRules::parse(
            "User-agent: *\n\
             Disallow: /\n\
             \n\
             User-agent: conciergebot\n\
             Disallow: /admin/\n",
        );

        assert!(!rules.is_allowed("OtherBot", "/page"));
        assert!(rules.is_allowed("ConciergeBot/0.1.0", "/page"));
        assert!(!rules.is_allowed("ConciergeBot/0.1.0", "/admin/settings"));
    }

    #[test]
    fn comments_and_empty_disallow_are_ignored() {
        let rules = RobotsRules::parse(
            "# full access\n\
             User-agent: *\n\
             Disallow:\n",
        );
        assert!(rules.is_allowed("AnyBot", "/anything"));
    }

    #[tokio::test]
    async fn missing_robots_means_unrestricted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cache = RobotsCache::new(reqwest::Client::new(), "ConciergeBot/0.1.0");
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        assert!(cache.is_allowed(&url).await);
    }

    #[tokio::test]
    async fn server_error_fails_closed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let cache = RobotsCache::new(reqwest::Client::new(), "ConciergeBot/0.1.0");
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        assert!(!cache.is_allowed(&url).await);
    }

    #[tokio::test]
    async fn unreachable_origin_fails_closed() {
        // Port 1 is never listening.
        let cache = RobotsCache::new(
            reqwest::Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
            "ConciergeBot/0.1.0",
        );
        let url = Url::parse("http://127.0.0.1:1/page").unwrap();
        assert!(!cache.is_allowed(&url).await);
    }

    #[tokio::test]
    async fn verdicts_are_cached_per_origin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /blocked/\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = RobotsCache::new(reqwest::Client::new(), "ConciergeBot/0.1.0");
        let a = Url::parse(&format!("{}/blocked/x", server.uri())).unwrap();
        let b = Url::parse(&format!("{}/open", server.uri())).unwrap();

        assert!(!cache.is_allowed(&a).await);
        assert!(cache.is_allowed(&b).await);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let cache = RobotsCache::new(reqwest::Client::new(), "ConciergeBot/0.1.0")
            .with_ttl(Duration::ZERO);
        let url = Url::parse(&format!("{}/page", server.uri())).unwrap();
        assert!(cache.is_allowed(&url).await);
        assert!(cache.is_allowed(&url).await);
    }
}
