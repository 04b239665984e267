//! Per-domain request throttling for polite fetching.
//!
//! Wraps any [`ResourceFetcher`] with a minimum delay between requests to
//! the same host. The storage dispatcher fetches remote items concurrently,
//! and most of a page's images usually live on one CDN host, so the
//! throttle is what keeps that fan-out from looking like a burst.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use gleaner_core::throttle::{ThrottleConfig, ThrottledFactory};
//!
//! # fn wrap<F: gleaner_core::traits::ResourceFetcherFactory>(factory: F) {
//! let config = ThrottleConfig::new(Duration::from_millis(500))
//!     .with_jitter(Duration::from_millis(250));
//! let factory = ThrottledFactory::new(factory, config);
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::error::CrawlError;
use crate::models::{FetchedResource, ResourceRequest};
use crate::session::SessionSnapshot;
use crate::traits::{ResourceFetcher, ResourceFetcherFactory};

/// Configuration for the throttled fetcher.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests to the same domain.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    /// 250ms delay, 250ms jitter.
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(250),
            jitter: Duration::from_millis(250),
        }
    }
}

/// A [`ResourceFetcher`] wrapper that enforces per-domain throttling.
///
/// Clones share the same schedule, so every concurrent fetch of one run
/// is throttled against the others.
#[derive(Clone)]
pub struct ThrottledFetcher<R> {
    inner: R,
    config: ThrottleConfig,
    /// Earliest time the next request to each domain may start.
    next_slot: Arc<Mutex<HashMap<String, Instant>>>,
}

impl<R: ResourceFetcher> ThrottledFetcher<R> {
    pub fn new(inner: R, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            next_slot: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// scheme://host:port
    fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    /// Claim the next free slot for `domain` and sleep until it starts.
    ///
    /// Slots are claimed under the lock, so concurrent callers queue up
    /// one delay apart instead of all waking at once.
    async fn wait_for_domain(&self, domain: &str) {
        let now = Instant::now();
        let start = {
            let mut slots = self.next_slot.lock().await;
            let start = slots.get(domain).copied().filter(|t| *t > now).unwrap_or(now);
            slots.insert(domain.to_string(), start + self.config.effective_delay());
            start
        };

        if start > now {
            let sleep = start - now;
            tracing::debug!(domain = %domain, sleep_ms = sleep.as_millis() as u64, "Throttling request");
            tokio::time::sleep(sleep).await;
        }
    }
}

impl<R: ResourceFetcher> ResourceFetcher for ThrottledFetcher<R> {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource, CrawlError> {
        if let Some(domain) = Self::domain_key(&request.url) {
            self.wait_for_domain(&domain).await;
        }
        self.inner.fetch(request).await
    }
}

/// Wraps a [`ResourceFetcherFactory`] so every fetcher it builds is throttled.
#[derive(Clone)]
pub struct ThrottledFactory<F> {
    inner: F,
    config: ThrottleConfig,
}

impl<F: ResourceFetcherFactory> ThrottledFactory<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self { inner, config }
    }
}

impl<F: ResourceFetcherFactory> ResourceFetcherFactory for ThrottledFactory<F> {
    type Fetcher = ThrottledFetcher<F::Fetcher>;

    fn from_session(&self, session: &SessionSnapshot) -> Result<Self::Fetcher, CrawlError> {
        let inner = self.inner.from_session(session)?;
        Ok(ThrottledFetcher::new(inner, self.config.clone()))
    }
}

// Xorshift seeded from the clock; good enough for jitter, not crypto.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
