//! Crawl frontier: queue, visited set, per-host pacing, and the page cap.
//!
//! The frontier is single-owner state. The engine wraps it in a mutex and
//! every decision (dedup check-and-insert, host fan-out accounting, cap
//! accounting) happens inside one lock acquisition, so two workers can never
//! claim the same URL or overshoot the cap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use url::Url;

/// Query parameters stripped during URL normalization.
const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "mc_cid", "mc_eid"];

/// Canonical form of a URL for deduplication and storage keys.
///
/// Strips the fragment and tracking parameters, sorts the remaining query
/// pairs, and trims the trailing slash from non-root paths.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &pairs {
            if v.is_empty() {
                query.append_key_only(k);
            } else {
                query.append_pair(k, v);
            }
        }
        normalized.set_query(Some(&query.finish()));
    }

    let mut s = normalized.to_string();
    if s.ends_with('/') && normalized.path() != "/" {
        s.pop();
    }
    s
}

/// What the frontier hands a worker that asks for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A URL claimed for this worker. The worker must later call
    /// [`Frontier::complete`] or [`Frontier::release`].
    Entry(Url),
    /// Nothing is eligible right now; ask again at the given instant.
    RetryAt(Instant),
    /// The crawl is over: queue drained or cap reached, and nothing inflight.
    Exhausted,
}

/// Single-owner crawl frontier.
pub struct Frontier {
    queue: VecDeque<Url>,
    visited: HashSet<String>,
    next_fetch_at: HashMap<String, Instant>,
    host_inflight: HashMap<String, usize>,
    host_fanout: usize,
    min_spacing: Duration,
    page_cap: usize,
    pages_started: usize,
    inflight: usize,
    cap_reached: bool,
}

impl Frontier {
    pub fn new(page_cap: usize, host_fanout: usize, min_spacing: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            visited: HashSet::new(),
            next_fetch_at: HashMap::new(),
            host_inflight: HashMap::new(),
            host_fanout: host_fanout.max(1),
            min_spacing,
            page_cap,
            pages_started: 0,
            inflight: 0,
            cap_reached: false,
        }
    }

    /// Add a URL if its normalized form has not been seen. The visited check
    /// and insert are one step, so a URL can only ever be enqueued once.
    pub fn enqueue(&mut self, url: Url) -> bool {
        let normalized = normalize_url(&url);
        if !self.visited.insert(normalized) {
            return false;
        }
        self.queue.push_back(url);
        true
    }

    /// Number of distinct URLs ever enqueued.
    pub fn discovered(&self) -> usize {
        self.visited.len()
    }

    /// Whether the page cap stopped the crawl.
    pub fn cap_reached(&self) -> bool {
        self.cap_reached
    }

    /// Claim the next eligible URL. Claiming counts against the page cap and
    /// the host fan-out immediately; a policy rejection must give the slot
    /// back via [`release`](Self::release).
    pub fn next(&mut self, now: Instant) -> Dispatch {
        if self.pages_started >= self.page_cap {
            self.cap_reached = self.cap_reached || !self.queue.is_empty();
            return self.drained(now);
        }
        if self.queue.is_empty() {
            return self.drained(now);
        }

        let mut earliest: Option<Instant> = None;
        for i in 0..self.queue.len() {
            let host = host_key(&self.queue[i]);

            if *self.host_inflight.get(&host).unwrap_or(&0) >= self.host_fanout {
                continue;
            }
            if let Some(&at) = self.next_fetch_at.get(&host) {
                if at > now {
                    earliest = Some(earliest.map_or(at, |e: Instant| e.min(at)));
                    continue;
                }
            }

            let url = self.queue.remove(i).expect("index in bounds");
            // Reserve the host at claim time; pacing is measured between
            // dispatches, not completions. `pace` raises this once the
            // host's effective delay is known.
            self.next_fetch_at
                .insert(host.clone(), now + self.min_spacing);
            *self.host_inflight.entry(host).or_insert(0) += 1;
            self.inflight += 1;
            self.pages_started += 1;
            return Dispatch::Entry(url);
        }

        Dispatch::RetryAt(earliest.unwrap_or(now + Duration::from_millis(50)))
    }

    /// Extend the host's next allowed dispatch time to `now + delay`.
    /// Called once the claimed URL's effective crawl delay is known.
    pub fn pace(&mut self, url: &Url, delay: Duration, now: Instant) {
        let at = now + delay;
        let slot = self.next_fetch_at.entry(host_key(url)).or_insert(at);
        if *slot < at {
            *slot = at;
        }
    }

    /// Finish a claimed URL after an actual fetch.
    pub fn complete(&mut self, url: &Url) {
        self.settle(&host_key(url));
    }

    /// Give back a claimed slot without fetching (policy rejection or stop).
    /// The cap only counts dispatched fetches.
    pub fn release(&mut self, url: &Url) {
        self.pages_started = self.pages_started.saturating_sub(1);
        self.settle(&host_key(url));
    }

    fn settle(&mut self, host: &str) {
        self.inflight = self.inflight.saturating_sub(1);
        if let Some(count) = self.host_inflight.get_mut(host) {
            *count = count.saturating_sub(1);
        }
    }

    fn drained(&self, now: Instant) -> Dispatch {
        if self.inflight > 0 {
            // Inflight pages may still discover links.
            Dispatch::RetryAt(now + Duration::from_millis(50))
        } else {
            Dispatch::Exhausted
        }
    }
}

fn host_key(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn normalization_strips_fragment_and_tracking() {
        assert_eq!(
            normalize_url(&url(
                "https://example.com/post?utm_source=x&b=2&a=1&fbclid=abc#section"
            )),
            "https://example.com/post?a=1&b=2"
        );
    }

    #[test]
    fn normalization_trims_trailing_slash_except_root() {
        assert_eq!(
            normalize_url(&url("https://example.com/docs/")),
            "https://example.com/docs"
        );
        assert_eq!(normalize_url(&url("https://example.com/")), "https://example.com/");
    }

    #[test]
    fn normalization_drops_empty_query() {
        assert_eq!(
            normalize_url(&url("https://example.com/post?utm_campaign=mail")),
            "https://example.com/post"
        );
    }

    #[test]
    fn normalization_reencodes_query_values() {
        // A decoded '&' or '=' must not corrupt the rebuilt query.
        assert_eq!(
            normalize_url(&url("https://example.com/p?q=a%26b%3Dc")),
            "https://example.com/p?q=a%26b%3Dc"
        );
    }

    #[test]
    fn duplicate_urls_enqueue_once() {
        let mut frontier = Frontier::new(100, 2, Duration::ZERO);
        assert!(frontier.enqueue(url("https://example.com/a")));
        assert!(!frontier.enqueue(url("https://example.com/a#part")));
        assert!(!frontier.enqueue(url("https://example.com/a?utm_source=x")));
        assert_eq!(frontier.discovered(), 1);

        let now = Instant::now();
        let Dispatch::Entry(claimed) = frontier.next(now) else {
            panic!("expected entry");
        };
        frontier.complete(&claimed);
        assert_eq!(frontier.next(now), Dispatch::Exhausted);
    }

    #[test]
    fn host_fanout_limits_concurrent_claims() {
        let mut frontier = Frontier::new(100, 2, Duration::ZERO);
        for i in 0..3 {
            frontier.enqueue(url(&format!("https://example.com/{i}")));
        }

        let now = Instant::now();
        let first = frontier.next(now);
        let second = frontier.next(now);
        assert!(matches!(first, Dispatch::Entry(_)));
        assert!(matches!(second, Dispatch::Entry(_)));
        assert!(matches!(frontier.next(now), Dispatch::RetryAt(_)));

        if let Dispatch::Entry(u) = first {
            frontier.complete(&u);
        }
        assert!(matches!(frontier.next(now), Dispatch::Entry(_)));
    }

    #[test]
    fn per_host_delay_defers_dispatch() {
        let mut frontier = Frontier::new(100, 2, Duration::ZERO);
        frontier.enqueue(url("https://example.com/a"));
        frontier.enqueue(url("https://example.com/b"));
        frontier.enqueue(url("https://other.net/c"));

        let now = Instant::now();
        let Dispatch::Entry(a) = frontier.next(now) else {
            panic!("expected entry");
        };
        frontier.pace(&a, Duration::from_secs(2), now);
        frontier.complete(&a);

        // example.com is paced; other.net is free.
        let Dispatch::Entry(next) = frontier.next(now) else {
            panic!("expected entry");
        };
        assert_eq!(next.host_str(), Some("other.net"));
        frontier.complete(&next);

        match frontier.next(now) {
            Dispatch::RetryAt(at) => assert!(at > now),
            other => panic!("expected retry, got {other:?}"),
        }

        // After the delay elapses the paced host dispatches again.
        assert!(matches!(
            frontier.next(now + Duration::from_secs(3)),
            Dispatch::Entry(_)
        ));
    }

    #[test]
    fn same_host_dispatches_are_spaced_at_claim_time() {
        // Fan-out of 2 would allow both claims at once; the spacing floor
        // must still keep them apart.
        let mut frontier = Frontier::new(100, 2, Duration::from_millis(500));
        frontier.enqueue(url("https://example.com/a"));
        frontier.enqueue(url("https://example.com/b"));

        let now = Instant::now();
        assert!(matches!(frontier.next(now), Dispatch::Entry(_)));
        assert!(matches!(frontier.next(now), Dispatch::RetryAt(_)));
        assert!(matches!(
            frontier.next(now + Duration::from_millis(500)),
            Dispatch::Entry(_)
        ));
    }

    #[test]
    fn pace_keeps_the_later_of_claim_and_effective_delay() {
        let mut frontier = Frontier::new(100, 2, Duration::from_millis(100));
        frontier.enqueue(url("https://example.com/a"));
        frontier.enqueue(url("https://example.com/b"));

        let now = Instant::now();
        let Dispatch::Entry(a) = frontier.next(now) else {
            panic!("expected entry");
        };
        // robots.txt raised the delay past the floor.
        frontier.pace(&a, Duration::from_secs(4), now);
        frontier.complete(&a);

        assert!(matches!(
            frontier.next(now + Duration::from_secs(1)),
            Dispatch::RetryAt(_)
        ));
        assert!(matches!(
            frontier.next(now + Duration::from_secs(4)),
            Dispatch::Entry(_)
        ));
    }

    #[test]
    fn page_cap_counts_dispatched_fetches_only() {
        let mut frontier = Frontier::new(2, 4, Duration::ZERO);
        for i in 0..4 {
            frontier.enqueue(url(&format!("https://example.com/{i}")));
        }

        let now = Instant::now();
        let Dispatch::Entry(rejected) = frontier.next(now) else {
            panic!("expected entry");
        };
        // Policy rejection releases the slot without consuming the cap.
        frontier.release(&rejected);

        let Dispatch::Entry(a) = frontier.next(now) else {
            panic!("expected entry");
        };
        let Dispatch::Entry(b) = frontier.next(now) else {
            panic!("expected entry");
        };
        frontier.complete(&a);
        frontier.complete(&b);

        assert_eq!(frontier.next(now), Dispatch::Exhausted);
        assert!(frontier.cap_reached());
    }

    #[test]
    fn exhaustion_waits_for_inflight_work() {
        let mut frontier = Frontier::new(10, 2, Duration::ZERO);
        frontier.enqueue(url("https://example.com/a"));

        let now = Instant::now();
        let Dispatch::Entry(a) = frontier.next(now) else {
            panic!("expected entry");
        };

        // Queue is empty but `a` may still yield links.
        assert!(matches!(frontier.next(now), Dispatch::RetryAt(_)));

        frontier.enqueue(url("https://example.com/b"));
        frontier.complete(&a);
        assert!(matches!(frontier.next(now), Dispatch::Entry(_)));
    }
}
