//! Crawl admission policy: allow/deny URL rules plus robots.txt.
//!
//! [`RuleSet`] is the pure half: compiled glob patterns evaluated without
//! I/O. [`RobotsCache`] is the effectful half: fetches and caches robots.txt
//! per origin. [`PolicyFilter`] composes the two, adding a host fence when no
//! allow patterns are configured, so an open policy still cannot wander off
//! the seed hosts.

pub mod robots;
pub mod rules;

pub use robots::{ROBOTS_TTL, RobotsCache, RobotsRules};
pub use rules::{RuleSet, RuleVerdict};

use std::collections::HashSet;
use std::time::Duration;

use url::Url;

use concierge_shared::{PolicyConfig, Result};

/// Why a URL was admitted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    /// A deny pattern matched.
    DeniedByPattern,
    /// The allow list is non-empty and nothing matched.
    NotAllowlisted,
    /// The allow list is empty and the host is not a seed host.
    OffSeedHost,
    /// robots.txt disallows the path, or could not be consulted.
    DeniedByRobots,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Combined admission filter for one ingestion run.
pub struct PolicyFilter {
    rules: RuleSet,
    /// Populated only when the allow list is empty.
    seed_hosts: Option<HashSet<String>>,
    robots: Option<RobotsCache>,
    crawl_delay_floor: Duration,
}

impl PolicyFilter {
    /// Build the filter from run configuration and the run's seed URLs.
    pub fn new(config: &PolicyConfig, seeds: &[Url], client: reqwest::Client) -> Result<Self> {
        let rules = RuleSet::compile(&config.allow_patterns, &config.deny_patterns)?;

        let seed_hosts = if config.allow_patterns.is_empty() {
            Some(
                seeds
                    .iter()
                    .filter_map(|u| u.host_str().map(str::to_string))
                    .collect(),
            )
        } else {
            None
        };

        let robots = config
            .respect_robots_txt
            .then(|| RobotsCache::new(client, config.user_agent.clone()));

        Ok(Self {
            rules,
            seed_hosts,
            robots,
            crawl_delay_floor: config.crawl_delay_floor,
        })
    }

    /// Evaluate a URL for crawling. Pattern rules run first; robots.txt is
    /// consulted only for URLs the rules already admit.
    pub async fn evaluate(&self, url: &Url) -> Verdict {
        match self.rules.evaluate(url.as_str()) {
            RuleVerdict::Denied => return Verdict::DeniedByPattern,
            RuleVerdict::NotAllowlisted => return Verdict::NotAllowlisted,
            RuleVerdict::Permitted => {}
        }

        if let Some(hosts) = &self.seed_hosts {
            let on_seed_host = url
                .host_str()
                .map(|h| hosts.contains(h))
                .unwrap_or(false);
            if !on_seed_host {
                return Verdict::OffSeedHost;
            }
        }

        if let Some(robots) = &self.robots {
            if !robots.is_allowed(url).await {
                return Verdict::DeniedByRobots;
            }
        }

        Verdict::Allowed
    }

    /// The configured lower bound on per-host delay, independent of robots.
    pub fn delay_floor(&self) -> Duration {
        self.crawl_delay_floor
    }

    /// Minimum delay between requests to `url`'s host: the configured floor,
    /// raised by the origin's robots.txt Crawl-delay when larger.
    pub async fn crawl_delay(&self, url: &Url) -> Duration {
        let robots_delay = match &self.robots {
            Some(robots) => robots.crawl_delay(url).await,
            None => None,
        };
        robots_delay
            .map(|d| d.max(self.crawl_delay_floor))
            .unwrap_or(self.crawl_delay_floor)
    }
}
